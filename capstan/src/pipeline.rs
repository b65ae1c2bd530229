//! Execution and merge pipeline.
//!
//! One logical query moves through these stages:
//!
//! ```text
//! template ─embed─▶ embedded ─┬─ per group ──▶ materialize ─▶ exclusions
//!                             │                     │
//!                             │        adjust windows (per-cluster only)
//!                             │                     │
//!                             │         platform adapt ─▶ call shape ─▶ execute
//!                             │                     │
//!                             │        split by identifiers (shared only)
//!                             └─────────────▶ merge groups ─▶ Execution
//! ```
//!
//! Operational failures never abort the pipeline: a failed query leaves an
//! error on that cluster's [`QueryResult`] and processing moves on. The one
//! exception is the first connectivity failure of the session, which is
//! returned as [`CapstanError::FatalConnectivity`].

use tracing::{debug, info, warn};

use crate::client::{ApiValue, DATA_QUERY_TIMEOUT};
use crate::collector::Collector;
use crate::error::{CapstanError, ClientError, MergeError, Result};
use crate::labels::{LabelFilterGroup, is_subset};
use crate::query::{
    CallShape, ClusterResultMap, Matrix, QueryRange, QueryResult, clusters_with_data, merge_into,
};
use crate::scrape::{AdjustScope, Adjusted, adjust_query};
use crate::template::EmbeddedQuery;

/// The outcome of one logical query across all clusters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// Per-cluster results gathered so far.
    pub results: ClusterResultMap,
    /// Set when merging groups hit a duplicate under the `fail` policy.
    pub error: Option<MergeError>,
}

impl Execution {
    /// Returns `true` if any cluster returned at least one series.
    pub fn found_data(&self) -> bool {
        self.results.values().any(QueryResult::has_data)
    }

    /// Number of clusters that returned at least one series.
    pub fn clusters_with_data(&self) -> usize {
        clusters_with_data(&self.results)
    }

    /// Converts a merge failure into an error, dropping partial results.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::Merge`] if the execution recorded one.
    pub fn into_results(self) -> Result<ClusterResultMap> {
        match self.error {
            Some(err) => Err(CapstanError::Merge(err)),
            None => Ok(self.results),
        }
    }
}

impl Collector {
    /// Runs a query template against every registered cluster.
    ///
    /// `range` of `None` runs an instant query. In per-cluster mode range
    /// windows are widened to each cluster's scrape interval, running
    /// discovery first if it has not happened yet.
    ///
    /// # Errors
    ///
    /// - [`CapstanError::Template`] if the template cannot be embedded
    /// - [`CapstanError::FatalConnectivity`] on the session's first
    ///   connectivity failure
    ///
    /// Merge conflicts are reported in [`Execution::error`] instead.
    pub fn execute(&self, template: &str, range: Option<&QueryRange>) -> Result<Execution> {
        self.run_template(template, range, true)
    }

    /// Like [`Collector::execute`] but without window adjustment.
    pub(crate) fn execute_unadjusted(
        &self,
        template: &str,
        range: Option<&QueryRange>,
    ) -> Result<Execution> {
        self.run_template(template, range, false)
    }

    fn run_template(&self, template: &str, range: Option<&QueryRange>, adjust: bool) -> Result<Execution> {
        let embedded = self.embedders.embed(template)?;
        debug!(template, embedded = embedded.text(), "embedded query template");

        let mut execution = Execution::default();
        for group in self.registry.groups() {
            let group_results = if self.settings.per_cluster {
                self.run_per_cluster(&embedded, &group.clusters, range, adjust)?
            } else {
                self.run_shared(&embedded, group, range)?
            };

            if let Err(err) = merge_into(&mut execution.results, group_results, self.settings.duplicate_policy) {
                warn!(template, error = %err, "merging label filter groups failed");
                execution.error = Some(err);
                break;
            }
        }
        Ok(execution)
    }

    fn run_per_cluster(
        &self,
        embedded: &EmbeddedQuery,
        clusters: &[String],
        range: Option<&QueryRange>,
        adjust: bool,
    ) -> Result<ClusterResultMap> {
        let mut results = ClusterResultMap::new();
        for cluster in clusters {
            let filter = self.registry.member_filter(cluster)?;
            let text = embedded.materialize(&filter);
            if self.is_excluded(cluster, &text) {
                info!(cluster = %cluster, query = %text, "query excluded for cluster");
                continue;
            }

            let adjusted = if adjust {
                adjust_query(self.scrape_table()?, AdjustScope::Cluster(cluster), &text)
            } else {
                Adjusted {
                    query: text,
                    min_interval: None,
                }
            };
            let query = self.platform().adapt(&adjusted.query);
            let shape = CallShape::decide(range, adjusted.min_interval);

            let result = self.call(cluster, &query, shape)?;
            results.insert(cluster.clone(), result);
        }
        Ok(results)
    }

    fn run_shared(
        &self,
        embedded: &EmbeddedQuery,
        group: &LabelFilterGroup,
        range: Option<&QueryRange>,
    ) -> Result<ClusterResultMap> {
        let text = embedded.materialize(&group.filter);
        let members: Vec<&String> = group
            .clusters
            .iter()
            .filter(|cluster| {
                let excluded = self.is_excluded(cluster, &text);
                if excluded {
                    info!(cluster = %cluster, query = %text, "query excluded for cluster");
                }
                !excluded
            })
            .collect();
        if members.is_empty() {
            return Ok(ClusterResultMap::new());
        }

        // Shared queries are not bound to one cluster, so windows stay as written.
        let query = self.platform().adapt(&text);
        let shape = CallShape::decide(range, None);
        let scope = group.clusters.join(",");
        let shared = self.call(&scope, &query, shape)?;

        let mut results = ClusterResultMap::new();
        for cluster in members {
            let Some(spec) = self.registry.spec(cluster) else {
                continue;
            };
            let matrix: Matrix = shared
                .matrix
                .iter()
                .filter(|stream| is_subset(&spec.identifiers, &stream.labels))
                .cloned()
                .collect();
            results.insert(
                cluster.clone(),
                QueryResult {
                    query: shared.query.clone(),
                    matrix,
                    error: shared.error.clone(),
                },
            );
        }
        Ok(results)
    }

    /// Sends one final query and classifies the outcome.
    fn call(&self, scope: &str, query: &str, shape: CallShape) -> Result<QueryResult> {
        debug!(scope, query, ?shape, "executing query");
        let outcome: std::result::Result<ApiValue, ClientError> = match shape {
            CallShape::Instant => self.api.query(query, None, DATA_QUERY_TIMEOUT),
            CallShape::Range { start, end, step } => {
                self.api.query_range(query, start, end, step, DATA_QUERY_TIMEOUT)
            }
            CallShape::Exemplars { start, end } => {
                self.api.query_exemplars(query, start, end, DATA_QUERY_TIMEOUT)
            }
        };

        match outcome.and_then(ApiValue::into_matrix) {
            Ok(matrix) => {
                if matrix.is_empty() {
                    debug!(scope, query, "query returned no series");
                }
                Ok(QueryResult::ok(query, matrix))
            }
            Err(err) if err.is_connectivity() => {
                let err = self.connectivity_error(scope, query, err)?;
                Ok(QueryResult::failed(query, err))
            }
            Err(err) => {
                warn!(scope, query, error = %err, "query failed");
                Ok(QueryResult::failed(query, err))
            }
        }
    }

    /// Runs a query and hands each cluster's matrix to `consume`.
    ///
    /// `consume` is called once per cluster whose query completed without
    /// error, including clusters whose matrix is empty. Returns the number
    /// of clusters that returned data.
    ///
    /// # Errors
    ///
    /// See [`Collector::execute`].
    pub fn query_each<F>(&self, template: &str, range: Option<&QueryRange>, mut consume: F) -> Result<usize>
    where
        F: FnMut(&str, &Matrix),
    {
        let execution = self.execute(template, range)?;
        if let Some(err) = &execution.error {
            warn!(template, error = %err, "results are partial");
        }
        for (cluster, result) in &execution.results {
            if result.error.is_none() {
                consume(cluster, &result.matrix);
            }
        }
        Ok(execution.clusters_with_data())
    }

    /// Tries templates in order until one finds data.
    ///
    /// Used where a metric has been renamed across exporter versions.
    /// Returns the index of the template that found data with its
    /// execution, or `None` if none did.
    ///
    /// # Errors
    ///
    /// See [`Collector::execute`].
    pub fn query_with_fallback(
        &self,
        templates: &[&str],
        range: Option<&QueryRange>,
    ) -> Result<Option<(usize, Execution)>> {
        for (index, template) in templates.iter().enumerate() {
            let execution = self.execute(template, range)?;
            if execution.found_data() {
                return Ok(Some((index, execution)));
            }
            debug!(template, "no data, trying next template");
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_counts() {
        let mut execution = Execution::default();
        assert!(!execution.found_data());
        execution
            .results
            .insert("a".to_string(), QueryResult::ok("q", vec![]));
        assert!(!execution.found_data());
        execution.results.insert(
            "b".to_string(),
            QueryResult::ok(
                "q",
                vec![crate::query::SampleStream::new(Default::default(), vec![])],
            ),
        );
        assert!(execution.found_data());
        assert_eq!(execution.clusters_with_data(), 1);
    }

    #[test]
    fn test_into_results_surfaces_merge_error() {
        let execution = Execution {
            results: ClusterResultMap::new(),
            error: Some(MergeError::DuplicateCluster {
                cluster: "a".to_string(),
            }),
        };
        assert!(matches!(
            execution.into_results(),
            Err(CapstanError::Merge(MergeError::DuplicateCluster { .. }))
        ));
    }
}
