//! # capstan
//!
//! Multi-cluster Prometheus query templating and execution.
//!
//! capstan runs one logical PromQL query against many Kubernetes clusters
//! that all report into a single Prometheus-compatible endpoint. Each
//! cluster is identified by a set of label pairs; query templates are
//! written once and capstan injects the right selectors, widens range
//! windows to each cluster's scrape interval, adapts the query to the
//! hosting platform and returns results keyed by cluster.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Templates are classified by shape and embedded once, then materialized
//!   per label filter
//! - Clusters sharing label names can be served by one shared query
//! - Scrape intervals are discovered lazily, at most once per session
//! - The first connectivity failure is fatal; later failures only cost data
//! - Historical windows stream straight to per-cluster CSV files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capstan::{Auth, ClusterFilterSpec, Collector, CollectorSettings, FilterRegistry, PrometheusClient};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FilterRegistry::from_specs([
//!     ClusterFilterSpec::new("prod", [("env", "prod")]),
//!     ClusterFilterSpec::new("staging", [("env", "staging")]),
//! ])?;
//! let api = PrometheusClient::new("http://prometheus:9090", Auth::None)?;
//! let collector = Collector::new(Box::new(api), registry, CollectorSettings::default());
//!
//! let found = collector.query_each("sum(rate(container_cpu_usage_seconds_total[5m])) by (namespace)", None, |cluster, matrix| {
//!     println!("{cluster}: {} series", matrix.len());
//! })?;
//! println!("{found} clusters returned data");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`FilterRegistry`] — Cluster label filters, grouped by label names
//! - [`Collector`] — Session state and query execution
//! - [`PrometheusClient`] — HTTP implementation of [`client::QueryApi`]
//! - [`WorkloadWriter`] — Historical windows to CSV
//!
//! ## Modules
//!
//! - [`labels`] — Cluster filter specs, label filters and the registry
//! - [`template`] — Template classification, embedding and materialization
//! - [`scrape`] — Scrape-interval discovery and range-window adjustment
//! - [`duration`] — PromQL duration literals
//! - [`platform`] — Backend classification and query adaptation
//! - [`client`] — Prometheus HTTP API client
//! - [`query`] — Results, result maps and merging
//! - [`collector`] — Collection session
//! - [`pipeline`] — Execution and merge pipeline
//! - [`workload`] — CSV workload extraction
//! - [`config`] — JSON configuration
//! - [`error`] — Error types

pub mod client;
pub mod collector;
pub mod config;
pub mod duration;
pub mod error;
pub mod labels;
pub mod pipeline;
pub mod platform;
pub mod query;
pub mod scrape;
pub mod template;
pub mod workload;

// Re-export primary API types at crate root for convenience.
pub use client::{Auth, PrometheusClient};
pub use collector::{Collector, CollectorSettings};
pub use config::CollectorConfig;
pub use error::{
    CapstanError, ClientError, ConfigError, FilterError, MergeError, Result, TemplateError,
    WorkloadError,
};
pub use labels::{ClusterFilterSpec, FilterRegistry, LabelFilter};
pub use pipeline::Execution;
pub use platform::Platform;
pub use query::{ClusterResultMap, DuplicatePolicy, QueryRange, QueryResult};
pub use workload::{Workload, WorkloadWriter};
