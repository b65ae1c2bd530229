//! Collection configuration.
//!
//! A [`CollectorConfig`] is loaded from a JSON file and describes the
//! endpoint, the clusters behind it and how collection runs. Durations are
//! PromQL literals such as `"5m"` or `"1h30m"`.
//!
//! ```json
//! {
//!   "prometheus": { "url": "http://prometheus:9090", "auth": { "type": "bearer", "token": "..." } },
//!   "clusters": [
//!     { "name": "prod", "identifiers": { "env": "prod" } },
//!     { "name": "staging", "identifiers": { "env": "staging" } }
//!   ],
//!   "collection": { "history_interval_count": 24, "interval": "1h", "step": "5m" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;
use url::Url;

use crate::client::Auth;
use crate::collector::{CollectorSettings, EndpointInfo};
use crate::duration::serde_promql;
use crate::error::{ConfigError, Result};
use crate::labels::{ClusterFilterSpec, FilterRegistry};
use crate::query::DuplicatePolicy;
use crate::scrape::{DEFAULT_LOOKBACK, DEFAULT_SCRAPE_INTERVAL, ExporterSpec};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// The monitoring endpoint.
    pub prometheus: PrometheusConfig,
    /// Clusters served by the endpoint.
    pub clusters: Vec<ClusterFilterSpec>,
    /// Collection settings.
    #[serde(default)]
    pub collection: CollectionConfig,
}

/// Endpoint connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// API root URL.
    pub url: String,
    /// Request authentication.
    #[serde(default)]
    pub auth: Auth,
    /// Requests are SigV4 signed by an installed request signer.
    #[serde(default)]
    pub sigv4: bool,
}

/// How collection runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Number of historical windows to walk.
    pub history_interval_count: u32,
    /// Length of each window.
    #[serde(with = "serde_promql")]
    pub interval: Duration,
    /// Query resolution within a window.
    #[serde(with = "serde_promql")]
    pub step: Duration,
    /// One query per cluster instead of one per filter group.
    pub per_cluster_queries: bool,
    /// How results of different filter groups are combined.
    pub duplicate_policy: DuplicatePolicy,
    /// Root of the CSV output tree.
    pub output_dir: PathBuf,
    /// Lookback for scrape-interval discovery.
    #[serde(with = "serde_promql")]
    pub scrape_lookback: Duration,
    /// Interval assumed when discovery finds nothing.
    #[serde(with = "serde_promql")]
    pub default_scrape_interval: Duration,
    /// Severity of repeated connectivity failures (`error`, `warn`, ...).
    pub connectivity_log_level: String,
    /// Exporters probed during discovery.
    pub exporters: Vec<ExporterSpec>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            history_interval_count: 1,
            interval: Duration::from_secs(3600),
            step: Duration::from_secs(300),
            per_cluster_queries: true,
            duplicate_policy: DuplicatePolicy::Fail,
            output_dir: PathBuf::from("output"),
            scrape_lookback: DEFAULT_LOOKBACK,
            default_scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            connectivity_log_level: "warn".to_string(),
            exporters: ExporterSpec::defaults(),
        }
    }
}

impl CollectorConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be loaded, and any error from [`CollectorConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for consistency.
    ///
    /// Cluster filters are validated by building the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for bad values and
    /// [`crate::FilterError`] for conflicting cluster filters.
    pub fn validate(&self) -> Result<()> {
        if let Err(err) = Url::parse(&self.prometheus.url) {
            return Err(invalid(format!("prometheus.url '{}': {err}", self.prometheus.url)));
        }

        if self.clusters.is_empty() {
            return Err(invalid("at least one cluster is required"));
        }

        let c = &self.collection;
        if c.history_interval_count == 0 {
            return Err(invalid("collection.history_interval_count must be at least 1"));
        }
        if c.interval.is_zero() {
            return Err(invalid("collection.interval cannot be zero"));
        }
        if c.step.is_zero() {
            return Err(invalid("collection.step cannot be zero"));
        }
        if c.step > c.interval {
            return Err(invalid("collection.step cannot exceed collection.interval"));
        }
        if c.scrape_lookback.is_zero() {
            return Err(invalid("collection.scrape_lookback cannot be zero"));
        }
        if c.default_scrape_interval.is_zero() {
            return Err(invalid("collection.default_scrape_interval cannot be zero"));
        }
        self.connectivity_log_level()?;

        self.registry()?;
        Ok(())
    }

    /// Builds the cluster filter registry.
    ///
    /// # Errors
    ///
    /// Returns the first [`crate::FilterError`] raised while registering.
    pub fn registry(&self) -> Result<FilterRegistry> {
        Ok(FilterRegistry::from_specs(self.clusters.iter().cloned())?)
    }

    /// Parses the configured connectivity log level.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown level name.
    pub fn connectivity_log_level(&self) -> Result<Level> {
        let name = &self.collection.connectivity_log_level;
        Level::from_str(name).map_err(|_| invalid(format!("unknown connectivity_log_level '{name}'")))
    }

    /// Builds collector settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the URL or log level is invalid.
    pub fn settings(&self) -> Result<CollectorSettings> {
        let url = Url::parse(&self.prometheus.url)
            .map_err(|err| invalid(format!("prometheus.url '{}': {err}", self.prometheus.url)))?;
        Ok(CollectorSettings {
            per_cluster: self.collection.per_cluster_queries,
            duplicate_policy: self.collection.duplicate_policy,
            scrape_lookback: self.collection.scrape_lookback,
            default_scrape_interval: self.collection.default_scrape_interval,
            connectivity_log_level: self.connectivity_log_level()?,
            exporters: self.collection.exporters.clone(),
            endpoint: EndpointInfo {
                url: Some(url),
                sigv4: self.prometheus.sigv4,
                password_set: self.prometheus.auth.has_password(),
            },
        })
    }
}

fn invalid(reason: impl Into<String>) -> crate::CapstanError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}
