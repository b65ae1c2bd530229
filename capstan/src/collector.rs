//! The collection session.
//!
//! A [`Collector`] owns everything that lives for one run: the API client,
//! the cluster filter registry, the embedder cache, the scrape-interval
//! table, the platform classification and the connectivity latch. Session
//! state is initialised at most once and is read-only afterwards:
//!
//! - the platform is classified on first use (`OnceLock`)
//! - scrape intervals are discovered on the first cluster-bound query
//!   (`OnceLock`), before any adjustment reads them
//! - the first connectivity failure flips an atomic latch exactly once
//!
//! Query execution itself lives in [`crate::pipeline`].

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{Level, debug, error, info, trace, warn};
use url::Url;

use crate::client::{BuildInfo, METADATA_TIMEOUT, QueryApi};
use crate::error::{CapstanError, ClientError, Result};
use crate::labels::FilterRegistry;
use crate::platform::Platform;
use crate::query::DuplicatePolicy;
use crate::scrape::{
    DEFAULT_LOOKBACK, DEFAULT_SCRAPE_INTERVAL, ExporterSpec, ScrapeTable, ScrapeTableBuilder,
    UP_METRIC, probe_template,
};
use crate::template::EmbedderCache;

/// Decides whether a cluster skips a query: `(cluster, query) -> skip`.
pub type ExclusionPredicate = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Facts about the endpoint used to classify the platform.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    /// The API root, if known.
    pub url: Option<Url>,
    /// Whether requests are SigV4 signed.
    pub sigv4: bool,
    /// Whether a basic-auth password is configured.
    pub password_set: bool,
}

/// Tunables for a collection session.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Run one query per cluster instead of one per label filter group.
    pub per_cluster: bool,
    /// How result maps of different groups are combined.
    pub duplicate_policy: DuplicatePolicy,
    /// Lookback used by scrape-interval probes.
    pub scrape_lookback: Duration,
    /// Interval used when discovery yields nothing for a cluster.
    pub default_scrape_interval: Duration,
    /// Severity for connectivity failures after the first.
    pub connectivity_log_level: Level,
    /// Exporters whose scrape intervals are probed.
    pub exporters: Vec<ExporterSpec>,
    /// Endpoint facts for platform classification.
    pub endpoint: EndpointInfo,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            per_cluster: true,
            duplicate_policy: DuplicatePolicy::Fail,
            scrape_lookback: DEFAULT_LOOKBACK,
            default_scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            connectivity_log_level: Level::WARN,
            exporters: ExporterSpec::defaults(),
            endpoint: EndpointInfo::default(),
        }
    }
}

/// A collection session over one monitoring endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use capstan::client::{Auth, PrometheusClient};
/// use capstan::collector::{Collector, CollectorSettings};
/// use capstan::labels::{ClusterFilterSpec, FilterRegistry};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let api = PrometheusClient::new("http://localhost:9090", Auth::None)?;
/// let registry = FilterRegistry::from_specs([
///     ClusterFilterSpec::new("prod", [("env", "prod")]),
///     ClusterFilterSpec::new("staging", [("env", "staging")]),
/// ])?;
/// let collector = Collector::new(Box::new(api), registry, CollectorSettings::default());
///
/// let execution = collector.execute("sum(kube_pod_info{}) by (namespace)", None)?;
/// println!("{} clusters returned data", execution.clusters_with_data());
/// # Ok(())
/// # }
/// ```
pub struct Collector {
    pub(crate) api: Box<dyn QueryApi>,
    pub(crate) registry: FilterRegistry,
    pub(crate) settings: CollectorSettings,
    pub(crate) embedders: EmbedderCache,
    scrape: OnceLock<ScrapeTable>,
    platform: OnceLock<Platform>,
    connectivity_failed: AtomicBool,
    exclusions: Vec<ExclusionPredicate>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("clusters", &self.registry.len())
            .field("settings", &self.settings)
            .field("platform", &self.platform.get())
            .field("discovered", &self.scrape.get().is_some())
            .field("exclusions", &self.exclusions.len())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a session.
    pub fn new(api: Box<dyn QueryApi>, registry: FilterRegistry, settings: CollectorSettings) -> Self {
        Self {
            api,
            registry,
            settings,
            embedders: EmbedderCache::new(),
            scrape: OnceLock::new(),
            platform: OnceLock::new(),
            connectivity_failed: AtomicBool::new(false),
            exclusions: Vec::new(),
        }
    }

    /// Registers a predicate that can veto a query for a cluster.
    pub fn add_exclusion<F>(&mut self, predicate: F)
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.exclusions.push(Box::new(predicate));
    }

    /// Uses an already known scrape table instead of probing.
    ///
    /// Returns `false` if discovery has already happened.
    pub fn preload_scrape_table(&self, table: ScrapeTable) -> bool {
        self.scrape.set(table).is_ok()
    }

    /// The cluster filter registry.
    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// The session settings.
    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// The backend platform, classified on first call.
    pub fn platform(&self) -> Platform {
        *self.platform.get_or_init(|| {
            let endpoint = &self.settings.endpoint;
            let platform = endpoint.url.as_ref().map_or(Platform::Vanilla, |url| {
                Platform::classify(url, endpoint.sigv4, endpoint.password_set)
            });
            info!(%platform, "classified monitoring platform");
            platform
        })
    }

    /// Returns `true` once a connectivity failure has been seen.
    pub fn connectivity_failed(&self) -> bool {
        self.connectivity_failed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_excluded(&self, cluster: &str, query: &str) -> bool {
        self.exclusions.iter().any(|predicate| predicate(cluster, query))
    }

    /// Handles a connectivity error.
    ///
    /// The first one of the session is returned as fatal; later ones are
    /// logged at the configured level and swallowed.
    pub(crate) fn connectivity_error(&self, scope: &str, query: &str, err: ClientError) -> Result<ClientError> {
        if self
            .connectivity_failed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!(scope, query, error = %err, "first connectivity failure, giving up");
            return Err(CapstanError::FatalConnectivity { source: err });
        }
        let level = self.settings.connectivity_log_level;
        if level == Level::ERROR {
            error!(scope, query, error = %err, "backend unreachable, data missing");
        } else if level == Level::WARN {
            warn!(scope, query, error = %err, "backend unreachable, data missing");
        } else if level == Level::INFO {
            info!(scope, query, error = %err, "backend unreachable, data missing");
        } else if level == Level::DEBUG {
            debug!(scope, query, error = %err, "backend unreachable, data missing");
        } else {
            trace!(scope, query, error = %err, "backend unreachable, data missing");
        }
        Ok(err)
    }

    /// Returns the scrape table, running discovery on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::FatalConnectivity`] if the probes hit the
    /// session's first connectivity failure.
    pub fn scrape_table(&self) -> Result<&ScrapeTable> {
        if let Some(table) = self.scrape.get() {
            return Ok(table);
        }
        let table = self.discover()?;
        Ok(self.scrape.get_or_init(|| table))
    }

    fn discover(&self) -> Result<ScrapeTable> {
        let lookback = self.settings.scrape_lookback;
        let mut builder = ScrapeTableBuilder::new(lookback, self.settings.default_scrape_interval);

        let up = self.execute_unadjusted(&probe_template(UP_METRIC, lookback), None)?;
        for (cluster, result) in &up.results {
            for stream in &result.matrix {
                if let Some(job) = stream.label("job")
                    && let Some((_, count)) = stream.last()
                {
                    builder.record_up(cluster, job, *count);
                }
            }
        }

        for exporter in &self.settings.exporters {
            let probe = self.execute_unadjusted(&probe_template(&exporter.probe_metric, lookback), None)?;
            for spec in self.registry.specs() {
                // The job with the most samples is the one scraped most often.
                let best = probe.results.get(&spec.name).and_then(|result| {
                    result
                        .matrix
                        .iter()
                        .filter_map(|s| Some((s.label("job")?, s.last()?.1)))
                        .max_by(|a, b| a.1.total_cmp(&b.1))
                });
                builder.record_exporter(
                    &spec.name,
                    exporter,
                    best.map(|(job, _)| job),
                    best.map(|(_, count)| count),
                );
            }
        }

        let table = builder.build();
        info!(
            clusters = table.clusters().count(),
            exporters = self.settings.exporters.len(),
            "scrape interval discovery complete"
        );
        Ok(table)
    }

    /// Fetches build information where the platform supports it.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::FatalConnectivity`] on the session's first
    /// connectivity failure, or [`CapstanError::Client`] for other failures.
    pub fn build_info(&self) -> Result<BuildInfo> {
        let platform = self.platform();
        if !platform.supports_build_info() {
            debug!(%platform, "build info not supported");
            return Ok(BuildInfo::NotDetected);
        }
        match self.api.build_info(METADATA_TIMEOUT) {
            Ok(details) => Ok(BuildInfo::Detected(details)),
            Err(err) if err.is_connectivity() => {
                Err(self.connectivity_error("build-info", "", err)?.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiValue, BuildDetails};
    use chrono::{DateTime, Utc};

    struct StaticApi;

    impl QueryApi for StaticApi {
        fn query(&self, _: &str, _: Option<DateTime<Utc>>, _: Duration) -> std::result::Result<ApiValue, ClientError> {
            Ok(ApiValue::Matrix(vec![]))
        }
        fn query_range(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Duration,
            _: Duration,
        ) -> std::result::Result<ApiValue, ClientError> {
            Ok(ApiValue::Matrix(vec![]))
        }
        fn query_exemplars(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Duration,
        ) -> std::result::Result<ApiValue, ClientError> {
            Ok(ApiValue::Matrix(vec![]))
        }
        fn build_info(&self, _: Duration) -> std::result::Result<BuildDetails, ClientError> {
            Ok(BuildDetails {
                version: "2.53.0".to_string(),
                ..BuildDetails::default()
            })
        }
    }

    fn collector(url: &str, sigv4: bool) -> Collector {
        let settings = CollectorSettings {
            endpoint: EndpointInfo {
                url: Some(Url::parse(url).unwrap()),
                sigv4,
                password_set: false,
            },
            ..CollectorSettings::default()
        };
        Collector::new(Box::new(StaticApi), FilterRegistry::new(), settings)
    }

    #[test]
    fn test_build_info_gate() {
        let vanilla = collector("http://prometheus:9090", false);
        assert_eq!(vanilla.platform(), Platform::Vanilla);
        assert!(matches!(vanilla.build_info().unwrap(), BuildInfo::Detected(d) if d.version == "2.53.0"));

        let amazon = collector("http://prometheus:9090", true);
        assert_eq!(amazon.platform(), Platform::AmazonManaged);
        assert_eq!(amazon.build_info().unwrap(), BuildInfo::NotDetected);
    }

    #[test]
    fn test_connectivity_latch_fires_once() {
        let collector = collector("http://prometheus:9090", false);
        let err = || ClientError::Timeout {
            url: "x".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(!collector.connectivity_failed());
        assert!(matches!(
            collector.connectivity_error("prod", "up", err()),
            Err(CapstanError::FatalConnectivity { .. })
        ));
        assert!(collector.connectivity_failed());
        assert!(collector.connectivity_error("prod", "up", err()).is_ok());
    }

    #[test]
    fn test_exclusions() {
        let mut collector = collector("http://prometheus:9090", false);
        collector.add_exclusion(|cluster, query| cluster == "prod" && query.contains("node_"));
        assert!(collector.is_excluded("prod", "node_load1"));
        assert!(!collector.is_excluded("staging", "node_load1"));
        assert!(!collector.is_excluded("prod", "kube_pod_info"));
    }

    #[test]
    fn test_preloaded_scrape_table_skips_discovery() {
        let collector = collector("http://prometheus:9090", false);
        let table = ScrapeTable::empty(Duration::from_secs(15));
        assert!(collector.preload_scrape_table(table.clone()));
        assert_eq!(collector.scrape_table().unwrap(), &table);
        assert!(!collector.preload_scrape_table(ScrapeTable::empty(Duration::from_secs(5))));
    }
}
