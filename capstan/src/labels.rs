//! Cluster label filter registry.
//!
//! Every cluster served by the shared monitoring endpoint is identified by a
//! set of label pairs (for example `env="prod"`). The registry validates that
//! those identifier sets are distinguishable and groups clusters whose
//! identifiers use the same label *names*, so that one templated query can
//! serve a whole group and its result can be split back per cluster.
//!
//! # Filter text
//!
//! A [`LabelFilter`] holds two pre-rendered strings that the templating
//! engine substitutes into queries:
//!
//! - `label_names`: comma-joined label names, e.g. `env,region`
//! - `labels`: comma-joined selector clauses, e.g. `env="prod",region="eu"`
//!
//! A filter built from one label set uses exact match (`=`). A filter built
//! from several label sets uses regex alternation (`=~"a|b"`).

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FilterError;

/// Label name to label value mapping with deterministic ordering.
pub type LabelSet = BTreeMap<String, String>;

/// Declares one cluster and the label pairs that identify its series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFilterSpec {
    /// Unique cluster name, used as the result map key and output directory.
    pub name: String,

    /// Identifying labels. Empty means the cluster owns every series.
    #[serde(default)]
    pub identifiers: LabelSet,
}

impl ClusterFilterSpec {
    /// Creates a cluster spec from a name and identifier pairs.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use capstan::labels::ClusterFilterSpec;
    ///
    /// let prod = ClusterFilterSpec::new("prod", [("env", "prod")]);
    /// assert!(!prod.is_catch_all());
    /// ```
    pub fn new<N, I, K, V>(name: N, identifiers: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            identifiers: identifiers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Creates a spec without identifiers; it must be the only cluster.
    pub fn catch_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifiers: LabelSet::new(),
        }
    }

    /// Returns `true` if the spec has no identifying labels.
    pub fn is_catch_all(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Fingerprint of the sorted identifier label names.
    pub fn fingerprint(&self) -> u64 {
        fingerprint(self.identifiers.keys().map(String::as_str))
    }
}

/// Pre-rendered selector text for one cluster or a group of clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelFilter {
    /// Comma-joined identifying label names, substituted into `by (...)`.
    pub label_names: String,
    /// Comma-joined selector clauses, substituted into `{...}`.
    pub labels: String,
}

impl LabelFilter {
    /// The filter of a catch-all cluster: both strings empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` if the filter selects nothing extra.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.label_names.is_empty()
    }
}

/// Builds the combined filter for label sets that share the same names.
///
/// Label names are taken from the first set in sorted order. With exactly
/// one set the clauses use exact match; with several they use regex
/// alternation over the distinct values in input order. An empty input or
/// a set without labels yields [`LabelFilter::empty`].
///
/// # Examples
///
/// ```rust
/// use capstan::labels::{compute_filter, LabelSet};
///
/// let prod: LabelSet = [("env".to_string(), "prod".to_string())].into();
/// let staging: LabelSet = [("env".to_string(), "staging".to_string())].into();
///
/// assert_eq!(compute_filter(&[&prod]).labels, r#"env="prod""#);
/// assert_eq!(compute_filter(&[&prod, &staging]).labels, r#"env=~"prod|staging""#);
/// ```
pub fn compute_filter(label_sets: &[&LabelSet]) -> LabelFilter {
    let Some(first) = label_sets.first() else {
        return LabelFilter::empty();
    };
    let op = if label_sets.len() == 1 {
        MatchOp::Exact
    } else {
        MatchOp::Regex
    };

    let names: Vec<&str> = first.keys().map(String::as_str).collect();
    let clauses: Vec<String> = names
        .iter()
        .map(|name| {
            let mut values: Vec<&str> = Vec::with_capacity(label_sets.len());
            for set in label_sets {
                if let Some(v) = set.get(*name)
                    && !values.contains(&v.as_str())
                {
                    values.push(v);
                }
            }
            render_clause(name, op, &values)
        })
        .collect();

    LabelFilter {
        label_names: names.join(","),
        labels: clauses.join(","),
    }
}

/// Computes the fingerprint of a label name set.
///
/// Names are sorted before hashing so the order they are given in does not
/// matter.
pub fn fingerprint<'a, I>(names: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = names.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = DefaultHasher::new();
    sorted.hash(&mut hasher);
    hasher.finish()
}

/// Returns `true` if every identifier is present in `series` with the same
/// value.
///
/// An empty identifier set matches every series.
///
/// # Examples
///
/// ```rust
/// use capstan::labels::{is_subset, LabelSet};
///
/// let ids: LabelSet = [("env".to_string(), "prod".to_string())].into();
/// let series: LabelSet = [
///     ("env".to_string(), "prod".to_string()),
///     ("pod".to_string(), "web-0".to_string()),
/// ].into();
///
/// assert!(is_subset(&ids, &series));
/// assert!(is_subset(&LabelSet::new(), &series));
/// assert!(!is_subset(&series, &ids));
/// ```
pub fn is_subset(identifiers: &LabelSet, series: &LabelSet) -> bool {
    identifiers
        .iter()
        .all(|(name, value)| series.get(name).is_some_and(|v| v == value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchOp {
    Exact,
    Regex,
}

fn render_clause(name: &str, op: MatchOp, values: &[&str]) -> String {
    let op = match op {
        MatchOp::Exact => "=",
        MatchOp::Regex => "=~",
    };
    let joined = values
        .iter()
        .map(|v| escape_value(v))
        .collect::<Vec<_>>()
        .join("|");
    format!("{name}{op}\"{joined}\"")
}

/// Escapes a value for use inside a double-quoted PromQL string.
fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Clusters whose identifiers use the same set of label names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilterGroup {
    /// Fingerprint of the sorted label name set.
    pub fingerprint: u64,
    /// The shared label names, sorted.
    pub label_names: Vec<String>,
    /// Member cluster names in registration order.
    pub clusters: Vec<String>,
    /// Combined filter selecting every member.
    pub filter: LabelFilter,
}

impl LabelFilterGroup {
    /// Number of member clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Returns `true` if the group has no members.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Registry of declared clusters and their label filter groups.
///
/// Registration validates distinctness up front so a misconfigured cluster
/// list fails before any query is sent.
///
/// # Examples
///
/// ```rust
/// use capstan::labels::{ClusterFilterSpec, FilterRegistry};
///
/// # fn main() -> Result<(), capstan::FilterError> {
/// let mut registry = FilterRegistry::new();
/// registry.register(ClusterFilterSpec::new("prod", [("env", "prod")]))?;
/// registry.register(ClusterFilterSpec::new("staging", [("env", "staging")]))?;
///
/// assert_eq!(registry.groups().len(), 1);
/// assert_eq!(registry.groups()[0].filter.labels, r#"env=~"prod|staging""#);
/// assert_eq!(registry.member_filter("prod")?.labels, r#"env=~"prod""#);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    specs: Vec<ClusterFilterSpec>,
    groups: Vec<LabelFilterGroup>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a list of specs, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first [`FilterError`] raised by [`FilterRegistry::register`].
    pub fn from_specs<I>(specs: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = ClusterFilterSpec>,
    {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Validates and registers a cluster.
    ///
    /// On success the cluster joins the group for its label name set and
    /// that group's combined filter is recomputed.
    ///
    /// # Errors
    ///
    /// - [`FilterError::EmptyName`] if the name is empty
    /// - [`FilterError::UnsafeName`] if the name contains `/` or `\`, or is
    ///   `.` or `..`
    /// - [`FilterError::DuplicateCluster`] if the name is taken
    /// - [`FilterError::CatchAllNotExclusive`] if a catch-all spec would
    ///   coexist with any other spec
    /// - [`FilterError::OverlappingIdentifier`] if another spec already
    ///   declares one of the same label pairs
    pub fn register(&mut self, spec: ClusterFilterSpec) -> Result<(), FilterError> {
        if spec.name.trim().is_empty() {
            return Err(FilterError::EmptyName);
        }
        // Cluster names become output directories.
        if spec.name.contains(['/', '\\']) || matches!(spec.name.as_str(), "." | "..") {
            return Err(FilterError::UnsafeName { name: spec.name });
        }

        for existing in &self.specs {
            if existing.name == spec.name {
                return Err(FilterError::DuplicateCluster {
                    name: spec.name.clone(),
                });
            }
            if existing.is_catch_all() || spec.is_catch_all() {
                return Err(FilterError::CatchAllNotExclusive {
                    name: spec.name.clone(),
                    other: existing.name.clone(),
                });
            }
            if let Some((label, value)) = spec
                .identifiers
                .iter()
                .find(|(k, v)| existing.identifiers.get(*k) == Some(*v))
            {
                return Err(FilterError::OverlappingIdentifier {
                    name: spec.name.clone(),
                    other: existing.name.clone(),
                    label: label.clone(),
                    value: value.clone(),
                });
            }
        }

        let fp = spec.fingerprint();
        let group_index = match self.groups.iter().position(|g| g.fingerprint == fp) {
            Some(index) => index,
            None => {
                self.groups.push(LabelFilterGroup {
                    fingerprint: fp,
                    label_names: spec.identifiers.keys().cloned().collect(),
                    clusters: Vec::new(),
                    filter: LabelFilter::empty(),
                });
                self.groups.len() - 1
            }
        };

        debug!(
            cluster = %spec.name,
            fingerprint = fp,
            identifiers = spec.identifiers.len(),
            "registered cluster filter"
        );

        self.groups[group_index].clusters.push(spec.name.clone());
        self.specs.push(spec);
        self.recompute(group_index);
        Ok(())
    }

    fn recompute(&mut self, group_index: usize) {
        let group = &self.groups[group_index];
        let sets: Vec<&LabelSet> = group
            .clusters
            .iter()
            .filter_map(|name| self.spec(name).map(|s| &s.identifiers))
            .collect();
        let filter = compute_filter(&sets);
        self.groups[group_index].filter = filter;
    }

    /// Returns the label filter groups in first-registration order.
    pub fn groups(&self) -> &[LabelFilterGroup] {
        &self.groups
    }

    /// Returns all registered specs in registration order.
    pub fn specs(&self) -> &[ClusterFilterSpec] {
        &self.specs
    }

    /// Looks up a spec by cluster name.
    pub fn spec(&self, name: &str) -> Option<&ClusterFilterSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Returns the group containing the named cluster.
    pub fn group_of(&self, name: &str) -> Option<&LabelFilterGroup> {
        self.groups
            .iter()
            .find(|g| g.clusters.iter().any(|c| c == name))
    }

    /// Returns the filter that selects only the named cluster.
    ///
    /// Inside a group of two or more the clauses keep the group's regex
    /// operator so the text differs from the shared query only in the value
    /// list. A lone cluster gets exact match.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::UnknownCluster`] if the name is not registered.
    pub fn member_filter(&self, name: &str) -> Result<LabelFilter, FilterError> {
        let unknown = || FilterError::UnknownCluster {
            name: name.to_string(),
        };
        let spec = self.spec(name).ok_or_else(unknown)?;
        let group = self.group_of(name).ok_or_else(unknown)?;

        if group.len() < 2 {
            return Ok(compute_filter(&[&spec.identifiers]));
        }

        let clauses: Vec<String> = spec
            .identifiers
            .iter()
            .map(|(k, v)| render_clause(k, MatchOp::Regex, &[v.as_str()]))
            .collect();
        Ok(LabelFilter {
            label_names: group.label_names.join(","),
            labels: clauses.join(","),
        })
    }

    /// Number of registered clusters.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns `true` if no cluster is registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_single_set_uses_exact_match() {
        let a = set(&[("region", "eu"), ("env", "prod")]);
        let filter = compute_filter(&[&a]);
        assert_eq!(filter.label_names, "env,region");
        assert_eq!(filter.labels, r#"env="prod",region="eu""#);
    }

    #[test]
    fn test_multiple_sets_use_regex() {
        let a = set(&[("env", "prod"), ("region", "eu")]);
        let b = set(&[("env", "staging"), ("region", "us")]);
        let c = set(&[("env", "dev"), ("region", "eu")]);
        let filter = compute_filter(&[&a, &b, &c]);
        assert_eq!(filter.label_names, "env,region");
        assert_eq!(filter.labels, r#"env=~"prod|staging|dev",region=~"eu|us""#);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(compute_filter(&[]).is_empty());
        assert!(compute_filter(&[&LabelSet::new()]).is_empty());
    }

    #[test]
    fn test_value_escaping() {
        let a = set(&[("team", r#"a"b"#)]);
        assert_eq!(compute_filter(&[&a]).labels, r#"team="a\"b""#);
    }

    #[test]
    fn test_fingerprint_ignores_order_and_values() {
        let a = ClusterFilterSpec::new("a", [("env", "x"), ("region", "y")]);
        let b = ClusterFilterSpec::new("b", [("region", "z"), ("env", "w")]);
        let c = ClusterFilterSpec::new("c", [("env", "x")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(fingerprint(["b", "a"]), fingerprint(["a", "b"]));
    }

    #[test]
    fn test_is_subset() {
        let series = set(&[("env", "prod"), ("pod", "web-0")]);
        assert!(is_subset(&LabelSet::new(), &series));
        assert!(is_subset(&LabelSet::new(), &LabelSet::new()));
        assert!(is_subset(&set(&[("env", "prod")]), &series));
        assert!(!is_subset(&set(&[("env", "staging")]), &series));
        assert!(!is_subset(&set(&[("cluster", "a")]), &series));
    }

    #[test]
    fn test_register_groups_by_label_names() {
        let mut registry = FilterRegistry::new();
        registry
            .register(ClusterFilterSpec::new("prod", [("env", "prod")]))
            .unwrap();
        registry
            .register(ClusterFilterSpec::new("eu", [("region", "eu")]))
            .unwrap();
        registry
            .register(ClusterFilterSpec::new("staging", [("env", "staging")]))
            .unwrap();

        assert_eq!(registry.len(), 3);
        let groups = registry.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].clusters, vec!["prod", "staging"]);
        assert_eq!(groups[0].filter.labels, r#"env=~"prod|staging""#);
        assert_eq!(groups[1].clusters, vec!["eu"]);
        assert_eq!(groups[1].filter.labels, r#"region="eu""#);
    }

    #[test]
    fn test_member_filter() {
        let registry = FilterRegistry::from_specs([
            ClusterFilterSpec::new("prod", [("env", "prod")]),
            ClusterFilterSpec::new("staging", [("env", "staging")]),
            ClusterFilterSpec::new("eu", [("region", "eu")]),
        ])
        .unwrap();

        let prod = registry.member_filter("prod").unwrap();
        assert_eq!(prod.labels, r#"env=~"prod""#);
        assert_eq!(prod.label_names, "env");
        assert_eq!(
            registry.member_filter("eu").unwrap().labels,
            r#"region="eu""#
        );
        assert_eq!(
            registry.member_filter("nope"),
            Err(FilterError::UnknownCluster {
                name: "nope".to_string()
            })
        );
    }

    #[test]
    fn test_register_rejects_empty_and_duplicate_names() {
        let mut registry = FilterRegistry::new();
        assert_eq!(
            registry.register(ClusterFilterSpec::new(" ", [("env", "a")])),
            Err(FilterError::EmptyName)
        );
        for name in ["..", ".", "../etc", "eu/prod", r"eu\prod"] {
            assert_eq!(
                registry.register(ClusterFilterSpec::new(name, [("env", "a")])),
                Err(FilterError::UnsafeName { name: name.to_string() })
            );
        }
        assert!(registry.is_empty());
        registry
            .register(ClusterFilterSpec::new("a", [("env", "a")]))
            .unwrap();
        registry
            .register(ClusterFilterSpec::new("eu.prod", [("env", "eu.prod")]))
            .unwrap();
        assert!(matches!(
            registry.register(ClusterFilterSpec::new("a", [("env", "b")])),
            Err(FilterError::DuplicateCluster { .. })
        ));
    }

    #[test]
    fn test_catch_all_must_be_exclusive() {
        let mut registry = FilterRegistry::new();
        registry.register(ClusterFilterSpec::catch_all("all")).unwrap();
        assert!(matches!(
            registry.register(ClusterFilterSpec::new("prod", [("env", "prod")])),
            Err(FilterError::CatchAllNotExclusive { .. })
        ));

        let mut registry = FilterRegistry::new();
        registry
            .register(ClusterFilterSpec::new("prod", [("env", "prod")]))
            .unwrap();
        assert!(matches!(
            registry.register(ClusterFilterSpec::catch_all("all")),
            Err(FilterError::CatchAllNotExclusive { .. })
        ));
    }

    #[test]
    fn test_overlapping_identifier_rejected() {
        let mut registry = FilterRegistry::new();
        registry
            .register(ClusterFilterSpec::new("a", [("env", "prod"), ("region", "eu")]))
            .unwrap();
        let err = registry
            .register(ClusterFilterSpec::new("b", [("env", "prod"), ("region", "us")]))
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::OverlappingIdentifier {
                name: "b".to_string(),
                other: "a".to_string(),
                label: "env".to_string(),
                value: "prod".to_string(),
            }
        );
        // Failed registration leaves the registry unchanged.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.groups()[0].clusters, vec!["a"]);
    }

    #[test]
    fn test_catch_all_filter_is_empty() {
        let registry = FilterRegistry::from_specs([ClusterFilterSpec::catch_all("all")]).unwrap();
        assert!(registry.groups()[0].filter.is_empty());
        assert!(registry.member_filter("all").unwrap().is_empty());
    }
}
