//! Scrape-interval reconciliation.
//!
//! `rate`, `increase` and `changes` need a range window of at least one
//! scrape interval or they silently return gaps. Exporters are scraped at
//! different cadences in different clusters, so the interval is measured
//! rather than configured:
//!
//! 1. For every exporter, and for the generic `up` series, a probe of the
//!    form `max(count_over_time(<metric>{}[L])) by (job)` is run per cluster.
//! 2. A sample count `c` over lookback `L` gives an interval of `round(L / c)`.
//! 3. Outgoing queries bound to one cluster have each range window widened
//!    by that cluster's interval for the exporter the metric belongs to.
//!
//! Exporters are recognised by metric name prefix, the text before the first
//! underscore (`container_cpu_usage_seconds_total` belongs to `container`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::duration::{format_duration, parse_duration, round_to_seconds};

/// Default probe lookback window.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(60 * 60);

/// Interval used when a cluster has no usable estimate.
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

/// Metric used by the generic probe.
pub const UP_METRIC: &str = "up";

/// Range-vector functions whose window is adjusted.
const ADJUSTED_FUNCTIONS: [&str; 3] = ["rate", "increase", "changes"];

/// An exporter whose scrape interval is probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterSpec {
    /// Human-readable exporter name, e.g. `cadvisor`.
    pub name: String,
    /// Metric name prefix before the first underscore, e.g. `container`.
    pub metric_prefix: String,
    /// A metric every instance of the exporter emits.
    pub probe_metric: String,
}

impl ExporterSpec {
    /// Creates an exporter spec.
    pub fn new(
        name: impl Into<String>,
        metric_prefix: impl Into<String>,
        probe_metric: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            metric_prefix: metric_prefix.into(),
            probe_metric: probe_metric.into(),
        }
    }

    /// The exporters probed when none are configured.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("cadvisor", "container", "container_cpu_usage_seconds_total"),
            Self::new("kube-state-metrics", "kube", "kube_pod_info"),
            Self::new("node-exporter", "node", "node_cpu_seconds_total"),
        ]
    }
}

/// Builds the probe query template for a metric.
///
/// The result is a template: cluster selectors are embedded into the `{}`.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use capstan::scrape::probe_template;
///
/// assert_eq!(
///     probe_template("up", Duration::from_secs(3600)),
///     "max(count_over_time(up{}[1h])) by (job)"
/// );
/// ```
pub fn probe_template(metric: &str, lookback: Duration) -> String {
    format!(
        "max(count_over_time({metric}{{}}[{}])) by (job)",
        format_duration(lookback)
    )
}

/// Estimates a scrape interval from a sample count over a lookback window.
///
/// Returns `None` for counts that cannot produce a positive interval.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use capstan::scrape::estimate_interval;
///
/// let lookback = Duration::from_secs(3600);
/// assert_eq!(estimate_interval(lookback, 60.0), Some(Duration::from_secs(60)));
/// assert_eq!(estimate_interval(lookback, 0.0), None);
/// ```
pub fn estimate_interval(lookback: Duration, count: f64) -> Option<Duration> {
    if !count.is_finite() || count <= 0.0 {
        return None;
    }
    let estimate = round_to_seconds(Duration::from_secs_f64(lookback.as_secs_f64() / count));
    (!estimate.is_zero()).then_some(estimate)
}

/// Returns the exporter prefix of a metric name.
pub fn metric_prefix(metric: &str) -> &str {
    metric.split_once('_').map_or(metric, |(prefix, _)| prefix)
}

/// Measured intervals for one exporter in one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterExporterInfo {
    /// Exporter name.
    pub exporter_name: String,
    /// Metric prefix the exporter owns.
    pub metric_prefix: String,
    /// The scrape job the exporter's probe metric came from.
    pub job_name: Option<String>,
    /// Interval estimated from the exporter's own probe metric.
    pub actual_scrape_interval: Option<Duration>,
    /// Interval estimated from the `up` series.
    pub up_scrape_interval: Option<Duration>,
}

impl ClusterExporterInfo {
    /// The best available estimate: the exporter's own, then `up`.
    pub fn effective_interval(&self) -> Option<Duration> {
        self.actual_scrape_interval.or(self.up_scrape_interval)
    }
}

/// Intervals discovered for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterScrapeInfo {
    /// Per-exporter estimates keyed by metric prefix.
    pub exporters: BTreeMap<String, ClusterExporterInfo>,
    /// `up`-based estimates keyed by job name.
    pub up_intervals: BTreeMap<String, Duration>,
}

impl ClusterScrapeInfo {
    /// The smallest `up`-based interval in the cluster.
    pub fn min_up_interval(&self) -> Option<Duration> {
        self.up_intervals.values().min().copied()
    }
}

/// Scrape intervals for every cluster, read-only after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTable {
    clusters: BTreeMap<String, ClusterScrapeInfo>,
    default_interval: Duration,
}

impl ScrapeTable {
    /// Creates an empty table where every lookup yields `default_interval`.
    pub fn empty(default_interval: Duration) -> Self {
        Self {
            clusters: BTreeMap::new(),
            default_interval,
        }
    }

    /// Returns the discovered information for a cluster.
    pub fn cluster(&self, cluster: &str) -> Option<&ClusterScrapeInfo> {
        self.clusters.get(cluster)
    }

    /// Iterates over clusters with discovered information.
    pub fn clusters(&self) -> impl Iterator<Item = (&str, &ClusterScrapeInfo)> {
        self.clusters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The interval used when nothing was discovered.
    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Resolves the interval for a metric prefix in a cluster.
    ///
    /// Falls back in order: the exporter's own estimate, its `up` estimate,
    /// the cluster's smallest `up` estimate, the default interval.
    pub fn interval_for(&self, cluster: &str, metric_prefix: &str) -> Duration {
        let Some(info) = self.clusters.get(cluster) else {
            return self.default_interval;
        };
        info.exporters
            .get(metric_prefix)
            .and_then(ClusterExporterInfo::effective_interval)
            .or_else(|| info.min_up_interval())
            .unwrap_or(self.default_interval)
    }
}

/// Accumulates probe results and resolves them into a [`ScrapeTable`].
#[derive(Debug, Clone)]
pub struct ScrapeTableBuilder {
    lookback: Duration,
    default_interval: Duration,
    clusters: BTreeMap<String, ClusterScrapeInfo>,
}

impl ScrapeTableBuilder {
    /// Creates a builder for probes run over `lookback`.
    pub fn new(lookback: Duration, default_interval: Duration) -> Self {
        Self {
            lookback,
            default_interval,
            clusters: BTreeMap::new(),
        }
    }

    /// Records the `up` probe sample count for one job of a cluster.
    pub fn record_up(&mut self, cluster: &str, job: &str, count: f64) {
        let info = self.clusters.entry(cluster.to_string()).or_default();
        if let Some(interval) = estimate_interval(self.lookback, count) {
            debug!(cluster, job, ?interval, "estimated up scrape interval");
            info.up_intervals.insert(job.to_string(), interval);
        }
    }

    /// Records an exporter probe result for a cluster.
    ///
    /// `job` and `count` are `None` when the probe returned no data.
    pub fn record_exporter(
        &mut self,
        cluster: &str,
        exporter: &ExporterSpec,
        job: Option<&str>,
        count: Option<f64>,
    ) {
        let actual = count.and_then(|c| estimate_interval(self.lookback, c));
        debug!(
            cluster,
            exporter = %exporter.name,
            job,
            ?actual,
            "estimated exporter scrape interval"
        );
        let info = self.clusters.entry(cluster.to_string()).or_default();
        info.exporters.insert(
            exporter.metric_prefix.clone(),
            ClusterExporterInfo {
                exporter_name: exporter.name.clone(),
                metric_prefix: exporter.metric_prefix.clone(),
                job_name: job.map(str::to_string),
                actual_scrape_interval: actual,
                up_scrape_interval: None,
            },
        );
    }

    /// Resolves each exporter's `up` estimate and freezes the table.
    ///
    /// An exporter uses the `up` interval of its own job when one was seen,
    /// otherwise the smallest `up` interval of the cluster.
    pub fn build(mut self) -> ScrapeTable {
        for info in self.clusters.values_mut() {
            let min_up = info.min_up_interval();
            for exporter in info.exporters.values_mut() {
                exporter.up_scrape_interval = exporter
                    .job_name
                    .as_ref()
                    .and_then(|job| info.up_intervals.get(job).copied())
                    .or(min_up);
            }
        }
        ScrapeTable {
            clusters: self.clusters,
            default_interval: self.default_interval,
        }
    }
}

/// What a query is bound to when it is adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustScope<'a> {
    /// The query serves a whole group and is not adjusted.
    Shared,
    /// The query runs for exactly one cluster.
    Cluster(&'a str),
}

/// A query after range-window adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjusted {
    /// The rewritten query text.
    pub query: String,
    /// Smallest scrape interval applied, used as the range query step.
    pub min_interval: Option<Duration>,
}

/// Widens the range windows of `rate`, `increase` and `changes` calls.
///
/// A window holding a duration `d` becomes `d + interval`; a window holding
/// a multiplier `*n` becomes `interval * n`. Windows that are neither, such
/// as subqueries, are left as written. `irate` and other names merely ending
/// in a function name are not touched.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use capstan::scrape::{adjust_query, AdjustScope, ScrapeTable};
///
/// let table = ScrapeTable::empty(Duration::from_secs(30));
/// let adjusted = adjust_query(&table, AdjustScope::Cluster("prod"), "rate(x[*4]) + increase(y[1m])");
/// assert_eq!(adjusted.query, "rate(x[2m]) + increase(y[1m30s])");
/// assert_eq!(adjusted.min_interval, Some(Duration::from_secs(30)));
/// ```
pub fn adjust_query(table: &ScrapeTable, scope: AdjustScope<'_>, query: &str) -> Adjusted {
    let AdjustScope::Cluster(cluster) = scope else {
        return Adjusted {
            query: query.to_string(),
            min_interval: None,
        };
    };

    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    let mut min_interval: Option<Duration> = None;

    for function in ADJUSTED_FUNCTIONS {
        let call = format!("{function}(");
        for (start, _) in query.match_indices(&call) {
            if query[..start].chars().next_back().is_some_and(is_ident_char) {
                continue;
            }
            let args_start = start + call.len();
            let Some((open, close)) = window_bounds(query, args_start) else {
                continue;
            };
            let window = &query[open + 1..close];
            let prefix = first_identifier(&query[args_start..open]).map_or("", metric_prefix);
            let interval = table.interval_for(cluster, prefix);

            let Some(adjusted) = adjust_window(window, interval) else {
                debug!(cluster, function, window, "range window left unchanged");
                continue;
            };
            min_interval = Some(min_interval.map_or(interval, |m| m.min(interval)));
            edits.push((open + 1, close, format_duration(adjusted)));
        }
    }

    edits.sort_by(|a, b| b.0.cmp(&a.0));
    let mut out = query.to_string();
    for (start, end, text) in edits {
        out.replace_range(start..end, &text);
    }

    Adjusted {
        query: out,
        min_interval,
    }
}

fn adjust_window(window: &str, interval: Duration) -> Option<Duration> {
    let window = window.trim();
    if let Some(multiplier) = window.strip_prefix('*') {
        let n: u32 = multiplier.trim().parse().ok()?;
        return interval.checked_mul(n);
    }
    let parsed = parse_duration(window).ok()?;
    parsed.checked_add(interval)
}

/// Finds the `[...]` window of the call whose arguments start at `from`.
///
/// Returns `None` if the call closes before a window is found.
fn window_bounds(query: &str, from: usize) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    for (i, c) in query[from..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return None,
            ')' => depth -= 1,
            '[' => {
                let open = from + i;
                let close = open + query[open..].find(']')?;
                return Some((open, close));
            }
            _ => {}
        }
    }
    None
}

fn first_identifier(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_alphabetic() || c == '_' || c == ':')?;
    let rest = &text[start..];
    let end = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}
