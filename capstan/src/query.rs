//! Query results and per-cluster result maps.
//!
//! Every logical query execution produces a [`ClusterResultMap`]: one
//! [`QueryResult`] per cluster, each holding a [`Matrix`] of sample streams.
//! Label filter groups are executed separately and their maps are combined
//! with [`merge_into`] under a [`DuplicatePolicy`].
//!
//! # Example Usage
//!
//! ```rust
//! use capstan::query::{merge, ClusterResultMap, DuplicatePolicy, QueryResult};
//!
//! let mut a = ClusterResultMap::new();
//! a.insert("prod".to_string(), QueryResult::ok("up", vec![]));
//! let mut b = ClusterResultMap::new();
//! b.insert("prod".to_string(), QueryResult::ok("up", vec![]));
//!
//! assert!(merge(a.clone(), b.clone(), DuplicatePolicy::Fail).is_err());
//! assert_eq!(merge(a, b, DuplicatePolicy::Override).unwrap().len(), 1);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::labels::LabelSet;

/// A single `(timestamp, value)` pair.
pub type Sample = (DateTime<Utc>, f64);

/// One labelled series and its samples in time order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
    /// Series labels, including `__name__` when the backend returns it.
    pub labels: LabelSet,
    /// Samples in ascending time order.
    pub samples: Vec<Sample>,
}

impl SampleStream {
    /// Creates a stream from labels and samples.
    pub fn new(labels: LabelSet, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }

    /// Returns the value of a label, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// The most recent sample.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }
}

/// A range query result: a list of sample streams.
pub type Matrix = Vec<SampleStream>;

/// The outcome of one query for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// The final query text sent to the backend.
    pub query: String,
    /// Returned series. Empty when the query failed or matched nothing.
    pub matrix: Matrix,
    /// Why the query produced no usable data, if it failed.
    pub error: Option<String>,
}

impl QueryResult {
    /// A successful result.
    pub fn ok(query: impl Into<String>, matrix: Matrix) -> Self {
        Self {
            query: query.into(),
            matrix,
            error: None,
        }
    }

    /// A failed result carrying an error description.
    pub fn failed(query: impl Into<String>, error: impl ToString) -> Self {
        Self {
            query: query.into(),
            matrix: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    /// Returns `true` if at least one series came back.
    pub fn has_data(&self) -> bool {
        !self.matrix.is_empty()
    }
}

/// Results of one logical query keyed by cluster name.
pub type ClusterResultMap = BTreeMap<String, QueryResult>;

/// What to do when two result maps both contain a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the merge and name the duplicated cluster.
    #[default]
    Fail,
    /// Keep the value already present.
    Ignore,
    /// Replace it with the incoming value.
    Override,
}

/// Merges `other` into `acc`.
///
/// With [`DuplicatePolicy::Fail`] all keys are checked before anything is
/// moved, so `acc` is left exactly as it was when an error is returned.
///
/// # Errors
///
/// Returns [`MergeError::DuplicateCluster`] under the `Fail` policy when a
/// cluster appears in both maps.
pub fn merge_into(
    acc: &mut ClusterResultMap,
    other: ClusterResultMap,
    policy: DuplicatePolicy,
) -> Result<(), MergeError> {
    if policy == DuplicatePolicy::Fail
        && let Some(cluster) = other.keys().find(|k| acc.contains_key(*k))
    {
        return Err(MergeError::DuplicateCluster {
            cluster: cluster.clone(),
        });
    }

    for (cluster, result) in other {
        match policy {
            DuplicatePolicy::Ignore => {
                acc.entry(cluster).or_insert(result);
            }
            DuplicatePolicy::Fail | DuplicatePolicy::Override => {
                acc.insert(cluster, result);
            }
        }
    }
    Ok(())
}

/// Merges two maps into a new one.
///
/// # Errors
///
/// See [`merge_into`]. No map is returned on error.
pub fn merge(
    first: ClusterResultMap,
    second: ClusterResultMap,
    policy: DuplicatePolicy,
) -> Result<ClusterResultMap, MergeError> {
    let mut merged = first;
    merge_into(&mut merged, second, policy)?;
    Ok(merged)
}

/// Time range of a ranged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Inclusive end.
    pub end: DateTime<Utc>,
    /// Resolution step. `None` lets the scrape interval decide.
    pub step: Option<Duration>,
    /// Step used when neither `step` nor a scrape interval applies.
    pub fallback_step: Option<Duration>,
}

impl QueryRange {
    /// Creates a range.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: Option<Duration>) -> Self {
        Self {
            start,
            end,
            step,
            fallback_step: None,
        }
    }

    /// Sets the step used when the query carries no scrape interval.
    #[must_use]
    pub fn with_fallback_step(mut self, step: Duration) -> Self {
        self.fallback_step = Some(step);
        self
    }
}

/// Which API call a query is sent as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// `/api/v1/query` at the current time.
    Instant,
    /// `/api/v1/query_range` with a step.
    Range {
        /// Inclusive start.
        start: DateTime<Utc>,
        /// Inclusive end.
        end: DateTime<Utc>,
        /// Resolution step.
        step: Duration,
    },
    /// `/api/v1/query_exemplars` over a range without a step.
    Exemplars {
        /// Inclusive start.
        start: DateTime<Utc>,
        /// Inclusive end.
        end: DateTime<Utc>,
    },
}

impl CallShape {
    /// Decides the call shape.
    ///
    /// No range means an instant query. A range is sent as a range query
    /// when it has a step, a scrape interval is known to use as one, or a
    /// fallback step is set, otherwise as an exemplar query.
    pub fn decide(range: Option<&QueryRange>, min_interval: Option<Duration>) -> Self {
        let Some(range) = range else {
            return Self::Instant;
        };
        match range.step.or(min_interval).or(range.fallback_step) {
            Some(step) => Self::Range {
                start: range.start,
                end: range.end,
                step,
            },
            None => Self::Exemplars {
                start: range.start,
                end: range.end,
            },
        }
    }
}

/// Number of clusters whose result carries data.
pub fn clusters_with_data(results: &ClusterResultMap) -> usize {
    results.values().filter(|r| r.has_data()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(query: &str, series: usize) -> QueryResult {
        let matrix = (0..series)
            .map(|i| SampleStream::new([("i".to_string(), i.to_string())].into(), vec![]))
            .collect();
        QueryResult::ok(query, matrix)
    }

    fn map(entries: &[(&str, QueryResult)]) -> ClusterResultMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_disjoint() {
        for policy in [DuplicatePolicy::Fail, DuplicatePolicy::Ignore, DuplicatePolicy::Override] {
            let merged = merge(
                map(&[("a", result("q1", 1))]),
                map(&[("b", result("q2", 2))]),
                policy,
            )
            .unwrap();
            assert_eq!(merged.len(), 2);
        }
    }

    #[test]
    fn test_merge_fail_policy() {
        let err = merge(
            map(&[("a", result("q1", 1)), ("b", result("q1", 1))]),
            map(&[("c", result("q2", 1)), ("b", result("q2", 1))]),
            DuplicatePolicy::Fail,
        )
        .unwrap_err();
        assert_eq!(
            err,
            MergeError::DuplicateCluster {
                cluster: "b".to_string()
            }
        );
    }

    #[test]
    fn test_merge_into_fail_leaves_accumulator() {
        let mut acc = map(&[("a", result("q1", 1))]);
        let before = acc.clone();
        let other = map(&[("z", result("q2", 1)), ("a", result("q2", 3))]);
        assert!(merge_into(&mut acc, other, DuplicatePolicy::Fail).is_err());
        assert_eq!(acc, before);
    }

    #[test]
    fn test_merge_override_and_ignore() {
        let first = map(&[("a", result("first", 1))]);
        let second = map(&[("a", result("second", 2))]);

        let overridden = merge(first.clone(), second.clone(), DuplicatePolicy::Override).unwrap();
        assert_eq!(overridden["a"].query, "second");

        let ignored = merge(first, second, DuplicatePolicy::Ignore).unwrap();
        assert_eq!(ignored["a"].query, "first");
    }

    #[test]
    fn test_duplicate_policy_serde() {
        let policy: DuplicatePolicy = serde_json::from_str("\"override\"").unwrap();
        assert_eq!(policy, DuplicatePolicy::Override);
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Fail);
    }

    #[test]
    fn test_call_shape() {
        let end = Utc::now();
        let start = end - chrono::Duration::hours(1);
        assert_eq!(CallShape::decide(None, Some(Duration::from_secs(30))), CallShape::Instant);

        let stepped = QueryRange::new(start, end, Some(Duration::from_secs(300)));
        assert!(matches!(
            CallShape::decide(Some(&stepped), Some(Duration::from_secs(30))),
            CallShape::Range { step, .. } if step == Duration::from_secs(300)
        ));

        let unstepped = QueryRange::new(start, end, None);
        assert!(matches!(
            CallShape::decide(Some(&unstepped), Some(Duration::from_secs(30))),
            CallShape::Range { step, .. } if step == Duration::from_secs(30)
        ));
        assert!(matches!(
            CallShape::decide(Some(&unstepped), None),
            CallShape::Exemplars { .. }
        ));

        let fallback = unstepped.with_fallback_step(Duration::from_secs(60));
        assert!(matches!(
            CallShape::decide(Some(&fallback), Some(Duration::from_secs(30))),
            CallShape::Range { step, .. } if step == Duration::from_secs(30)
        ));
        assert!(matches!(
            CallShape::decide(Some(&fallback), None),
            CallShape::Range { step, .. } if step == Duration::from_secs(60)
        ));
    }

    #[test]
    fn test_clusters_with_data() {
        let results = map(&[
            ("a", result("q", 0)),
            ("b", result("q", 2)),
            ("c", QueryResult::failed("q", "boom")),
        ]);
        assert_eq!(clusters_with_data(&results), 1);
        assert_eq!(results["c"].error.as_deref(), Some("boom"));
    }
}
