//! Observability platform detection and query adaptation.
//!
//! Managed Prometheus offerings differ from a vanilla server in small ways
//! that matter to the collector. Google's managed service relabels the
//! `namespace` and `pod` labels of scraped series to `exported_namespace`
//! and `exported_pod`, so queries against it are rewritten to copy them
//! back. Amazon's and Azure's offerings do not serve the build-info
//! endpoint.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::template::closing_quote;

/// Metric name prefixes whose series carry relabelled pod metadata.
const KNOWN_PREFIXES: [&str; 2] = ["kube_", "container_"];

/// The monitoring backend behind the configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// A self-hosted Prometheus-compatible server.
    Vanilla,
    /// Amazon Managed Service for Prometheus.
    AmazonManaged,
    /// Azure Monitor managed service for Prometheus.
    AzureManaged,
    /// Google Cloud Managed Service for Prometheus.
    GoogleManaged,
    /// Grafana Cloud hosted Prometheus.
    GrafanaCloud,
}

impl Platform {
    /// Classifies an endpoint.
    ///
    /// Checked in order: SigV4 signing or an `aps-workspaces.` host means
    /// Amazon; a `.prometheus.monitor.azure.com` host means Azure; a
    /// `monitoring.googleapis.com` host means Google; a `grafana.net` host
    /// with a password configured means Grafana Cloud. Anything else is
    /// vanilla.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use capstan::platform::Platform;
    /// use url::Url;
    ///
    /// let url = Url::parse("https://monitoring.googleapis.com/v1/projects/p/location/global/prometheus").unwrap();
    /// assert_eq!(Platform::classify(&url, false, false), Platform::GoogleManaged);
    /// ```
    pub fn classify(endpoint: &Url, sigv4: bool, password_set: bool) -> Self {
        let host = endpoint.host_str().unwrap_or_default().to_ascii_lowercase();

        if sigv4 || host.starts_with("aps-workspaces.") {
            Self::AmazonManaged
        } else if host.ends_with(".prometheus.monitor.azure.com") {
            Self::AzureManaged
        } else if host.starts_with("monitoring.googleapis.com") {
            Self::GoogleManaged
        } else if host.contains("grafana.net") && password_set {
            Self::GrafanaCloud
        } else {
            Self::Vanilla
        }
    }

    /// Returns `false` for platforms that do not serve build information.
    pub fn supports_build_info(self) -> bool {
        !matches!(self, Self::AmazonManaged | Self::AzureManaged)
    }

    /// Returns the query adapter registered for this platform, if any.
    pub fn adapter(self) -> Option<&'static dyn QueryAdapter> {
        match self {
            Self::GoogleManaged => Some(&GoogleManagedAdapter),
            _ => None,
        }
    }

    /// Applies this platform's adapter, or returns the query unchanged.
    pub fn adapt(self, query: &str) -> String {
        match self.adapter() {
            Some(adapter) => adapter.adapt(query),
            None => query.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vanilla => "vanilla",
            Self::AmazonManaged => "amazon-managed",
            Self::AzureManaged => "azure-managed",
            Self::GoogleManaged => "google-managed",
            Self::GrafanaCloud => "grafana-cloud",
        };
        f.write_str(name)
    }
}

/// Rewrites queries for a platform's labelling behaviour.
pub trait QueryAdapter: Send + Sync {
    /// Returns the adapted query text.
    fn adapt(&self, query: &str) -> String;
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-zA-Z_][\w:]*").expect("Invalid regex for identifiers"));

static MODIFIERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\s+offset\s+-?\w+|\s*@\s*(?:[\d.]+|start\(\)|end\(\)))+")
        .expect("Invalid regex for offset and @ modifiers")
});

static CLAUSE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:by|without|on|ignoring|group_left|group_right)\s*\(")
        .expect("Invalid regex for grouping clauses")
});

/// Restores `namespace` and `pod` on Google Cloud Managed Prometheus.
///
/// A call whose own argument carries a range selector (`rate`, `changes`,
/// `deriv`, a subquery under `max_over_time`, ...) is wrapped whole in two
/// `label_replace` calls. Direct `kube_` / `container_` metric references
/// are wrapped together with any `offset` or `@` modifier, unless a range
/// selector follows them. Calls that mention neither prefix, and anything
/// inside a selector, a grouping or matching clause, or a string literal,
/// are left alone.
///
/// # Examples
///
/// ```rust
/// use capstan::platform::{GoogleManagedAdapter, QueryAdapter};
///
/// let adapted = GoogleManagedAdapter.adapt("sum(kube_pod_info) by (namespace)");
/// assert!(adapted.starts_with("sum(label_replace(label_replace(kube_pod_info,"));
/// assert_eq!(GoogleManagedAdapter.adapt("metric{} unless on (x) metric2{}"), "metric{} unless on (x) metric2{}");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleManagedAdapter;

impl GoogleManagedAdapter {
    fn wrap(expr: &str) -> String {
        format!(
            r#"label_replace(label_replace({expr}, "namespace", "$1", "exported_namespace", "(.+)"), "pod", "$1", "exported_pod", "(.+)")"#
        )
    }
}

impl QueryAdapter for GoogleManagedAdapter {
    fn adapt(&self, query: &str) -> String {
        let protected = protected_spans(query);
        let mut out = String::with_capacity(query.len());
        let mut last = 0;

        for ident in IDENTIFIER.find_iter(query) {
            let start = ident.start();
            if start < last || protected.iter().any(|(s, e)| (*s..*e).contains(&start)) {
                continue;
            }
            let Some(end) = target_end(query, start, ident.end()) else {
                continue;
            };
            out.push_str(&query[last..start]);
            out.push_str(&Self::wrap(&query[start..end]));
            last = end;
        }
        out.push_str(&query[last..]);
        out
    }
}

/// End of the expression to wrap when the identifier at `start` begins one.
fn target_end(query: &str, start: usize, ident_end: usize) -> Option<usize> {
    let bytes = query.as_bytes();
    let next = skip_spaces(bytes, ident_end);

    if bytes.get(next) == Some(&b'(') {
        let close = closing(bytes, next, b'(', b')')?;
        let mentions_prefix = KNOWN_PREFIXES.iter().any(|p| query[next..close].contains(p));
        return (mentions_prefix && has_top_level_range(&bytes[next + 1..close])).then_some(close + 1);
    }

    if !KNOWN_PREFIXES.iter().any(|p| query[start..ident_end].starts_with(p)) {
        return None;
    }
    let mut end = ident_end;
    if bytes.get(end) == Some(&b'{') {
        end = closing(bytes, end, b'{', b'}')? + 1;
    }
    if bytes.get(skip_spaces(bytes, end)) == Some(&b'[') {
        return None;
    }
    Some(end + MODIFIERS.find(&query[end..]).map_or(0, |m| m.end()))
}

fn skip_spaces(bytes: &[u8], mut i: usize) -> usize {
    while bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

/// Index of the delimiter closing the one at `open`, skipping string literals.
fn closing(bytes: &[u8], open: usize, left: u8, right: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => i = closing_quote(bytes, i)?,
            b if b == left => depth += 1,
            b if b == right => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Whether a call argument has a range selector outside nested calls.
fn has_top_level_range(arg: &[u8]) -> bool {
    let mut depth = 0usize;
    let mut i = 0;
    while i < arg.len() {
        match arg[i] {
            b'"' | b'\'' | b'`' => match closing_quote(arg, i) {
                Some(end) => i = end,
                None => return false,
            },
            b'{' => match closing(arg, i, b'{', b'}') {
                Some(end) => i = end,
                None => return false,
            },
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'[' if depth == 0 => return true,
            _ => {}
        }
        i += 1;
    }
    false
}

/// Byte spans of selectors, clauses and string literals.
fn protected_spans(query: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let bytes = query.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                let end = closing_quote(bytes, i).unwrap_or(bytes.len());
                spans.push((i, end));
                i = end;
            }
            b'{' => {
                let end = query[i..].find('}').map_or(bytes.len(), |e| i + e);
                spans.push((i, end));
                i = end;
            }
            _ => i += 1,
        }
    }

    for m in CLAUSE_OPEN.find_iter(query) {
        let end = query[m.end()..].find(')').map_or(bytes.len(), |e| m.end() + e);
        spans.push((m.end(), end));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_classify() {
        let cases = [
            ("https://aps-workspaces.us-east-1.amazonaws.com/workspaces/ws-1", false, false, Platform::AmazonManaged),
            ("https://prom.internal:9090", true, false, Platform::AmazonManaged),
            ("https://ws-1.eastus.prometheus.monitor.azure.com", false, false, Platform::AzureManaged),
            ("https://monitoring.googleapis.com/v1/projects/p/location/global/prometheus", false, false, Platform::GoogleManaged),
            ("https://prometheus-prod-01.grafana.net/api/prom", false, true, Platform::GrafanaCloud),
            ("https://prometheus-prod-01.grafana.net/api/prom", false, false, Platform::Vanilla),
            ("http://localhost:9090", false, true, Platform::Vanilla),
        ];
        for (endpoint, sigv4, password, expected) in cases {
            assert_eq!(Platform::classify(&url(endpoint), sigv4, password), expected, "{endpoint}");
        }
    }

    #[test]
    fn test_build_info_gate() {
        assert!(Platform::Vanilla.supports_build_info());
        assert!(Platform::GoogleManaged.supports_build_info());
        assert!(Platform::GrafanaCloud.supports_build_info());
        assert!(!Platform::AmazonManaged.supports_build_info());
        assert!(!Platform::AzureManaged.supports_build_info());
    }

    #[test]
    fn test_only_google_has_adapter() {
        assert!(Platform::GoogleManaged.adapter().is_some());
        assert!(Platform::Vanilla.adapter().is_none());
        assert_eq!(Platform::Vanilla.adapt("kube_pod_info"), "kube_pod_info");
    }

    #[test]
    fn test_wraps_direct_metric() {
        let adapted = GoogleManagedAdapter.adapt(r#"sum(kube_pod_info{env="p"}) by (namespace)"#);
        assert_eq!(
            adapted,
            r#"sum(label_replace(label_replace(kube_pod_info{env="p"}, "namespace", "$1", "exported_namespace", "(.+)"), "pod", "$1", "exported_pod", "(.+)")) by (namespace)"#
        );
    }

    #[test]
    fn test_wraps_range_call_once() {
        let query = "sum(rate(container_cpu_usage_seconds_total{container!=\"\"}[5m])) by (pod)";
        let adapted = GoogleManagedAdapter.adapt(query);
        assert_eq!(adapted.matches("label_replace(label_replace(rate(").count(), 1);
        assert_eq!(adapted.matches("label_replace(").count(), 2);
        assert!(adapted.ends_with(" by (pod)"));
    }

    #[test]
    fn test_nested_call_is_matched_whole() {
        let query = "max_over_time(sum(rate(container_x[1m]))[5m:1m])";
        let adapted = GoogleManagedAdapter.adapt(query);
        assert!(adapted.starts_with("label_replace(label_replace(max_over_time(sum(rate(container_x[1m]))[5m:1m]),"));
    }

    #[test]
    fn test_wraps_any_range_vector_call() {
        let adapted = GoogleManagedAdapter.adapt("changes(kube_pod_container_status_restarts_total[5m])");
        assert_eq!(
            adapted,
            r#"label_replace(label_replace(changes(kube_pod_container_status_restarts_total[5m]), "namespace", "$1", "exported_namespace", "(.+)"), "pod", "$1", "exported_pod", "(.+)")"#
        );

        for query in [
            "deriv(container_memory_working_set_bytes[10m])",
            "predict_linear(container_fs_usage_bytes{device=\"sda\"}[1h], 3600)",
            "quantile_over_time(0.9, container_memory_rss[5m] offset 1h)",
            "resets(kube_x[30m])",
        ] {
            let adapted = GoogleManagedAdapter.adapt(query);
            assert!(adapted.starts_with(&format!("label_replace(label_replace({query},")), "{adapted}");
            assert_eq!(adapted.matches("label_replace(").count(), 2, "{adapted}");
        }
    }

    #[test]
    fn test_range_call_inside_aggregation() {
        let adapted = GoogleManagedAdapter.adapt("histogram_quantile(0.9, sum(delta(kube_x[5m])) by (le))");
        assert!(adapted.starts_with("histogram_quantile(0.9, sum(label_replace(label_replace(delta(kube_x[5m]),"));
        assert!(adapted.ends_with(")) by (le))"));
    }

    #[test]
    fn test_metric_keeps_its_modifiers() {
        let adapted = GoogleManagedAdapter.adapt("sum(kube_pod_info offset 1h) by (namespace)");
        assert!(adapted.starts_with("sum(label_replace(label_replace(kube_pod_info offset 1h, \"namespace\""));
        assert!(adapted.ends_with(") by (namespace)"));
    }

    #[test]
    fn test_leaves_unrelated_queries() {
        for query in [
            "metric{} unless on (x) metric2{}",
            "rate(http_requests_total[5m])",
            r#"up{job="kube_state"}"#,
            "sum(x) by (container_name)",
        ] {
            assert_eq!(GoogleManagedAdapter.adapt(query), query);
        }
    }
}
