//! Error types for the capstan collection engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all capstan operations.
///
/// Configuration-class errors (filters, templates, config files) are raised
/// before any network call is made. Query-time problems are mostly recorded
/// on the per-cluster result and logged instead of surfacing here; the
/// exceptions are merge conflicts and the first connectivity failure of a
/// session, which is reported as [`CapstanError::FatalConnectivity`].
#[derive(Error, Debug)]
pub enum CapstanError {
    /// Error registering a cluster label filter.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Error embedding cluster selectors into a query template.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Error parsing a PromQL duration literal.
    #[error("duration error: {0}")]
    Duration(#[from] DurationError),

    /// Error talking to the Prometheus API.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Error merging per-cluster results.
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Error writing workload output.
    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The first connectivity failure of the session.
    ///
    /// A backend that cannot be reached on first contact is treated as a
    /// misconfiguration; callers are expected to stop the process.
    #[error("cannot reach the Prometheus API (first connectivity failure): {source}")]
    FatalConnectivity {
        /// The underlying connectivity error.
        #[source]
        source: ClientError,
    },
}

/// Errors that can occur when registering cluster filters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The cluster name is empty.
    #[error("cluster name must not be empty")]
    EmptyName,

    /// The cluster name cannot be used as an output directory name.
    #[error("cluster name '{name}' must not contain path separators or be '.' or '..'")]
    UnsafeName {
        /// The rejected cluster name.
        name: String,
    },

    /// A cluster with this name is already registered.
    #[error("cluster '{name}' is already registered")]
    DuplicateCluster {
        /// The duplicated cluster name.
        name: String,
    },

    /// A catch-all filter (no identifiers) would coexist with another filter.
    #[error("cluster '{name}' cannot be distinguished from '{other}': a filter without identifiers must be the only filter")]
    CatchAllNotExclusive {
        /// The cluster being registered.
        name: String,
        /// The already registered cluster.
        other: String,
    },

    /// Two filters declare the same identifying label pair.
    #[error("cluster '{name}' cannot be distinguished from '{other}': both declare {label}=\"{value}\"")]
    OverlappingIdentifier {
        /// The cluster being registered.
        name: String,
        /// The already registered cluster.
        other: String,
        /// The shared label name.
        label: String,
        /// The shared label value.
        value: String,
    },

    /// The named cluster is not registered.
    #[error("unknown cluster '{name}'")]
    UnknownCluster {
        /// The cluster name that was looked up.
        name: String,
    },
}

/// Errors that can occur while embedding a query template.
///
/// These are authoring bugs in the template itself, never runtime
/// conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The template is empty or whitespace only.
    #[error("query template is empty")]
    Empty,

    /// The template already contains one of the reserved marker tokens.
    #[error("query template '{template}' already contains reserved marker '{marker}'")]
    ReservedMarker {
        /// The offending template.
        template: String,
        /// The marker found in it.
        marker: &'static str,
    },

    /// A delimiter did not occur the number of times the shape requires.
    #[error("query template '{template}': expected {expected} occurrence(s) of '{delimiter}', found {found}")]
    DelimiterCount {
        /// The offending template.
        template: String,
        /// The delimiter being counted.
        delimiter: char,
        /// How many the shape expects.
        expected: usize,
        /// How many were found.
        found: usize,
    },

    /// A grouping clause is opened but never closed.
    #[error("query template '{template}': grouping clause at offset {offset} is not terminated")]
    UnterminatedGrouping {
        /// The offending template.
        template: String,
        /// Byte offset of the clause's opening parenthesis.
        offset: usize,
    },
}

/// Error parsing a PromQL-style duration such as `1h30m` or `15s`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid duration '{value}': {reason}")]
pub struct DurationError {
    /// The text that failed to parse.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

/// Errors that can occur while calling the Prometheus HTTP API.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint '{url}': {source}")]
    InvalidEndpoint {
        /// The configured URL.
        url: String,
        /// The parse error.
        #[source]
        source: url::ParseError,
    },

    /// Failed to create the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The backend could not be reached at all.
    #[error("cannot connect to '{url}': {source}")]
    Connect {
        /// The request URL.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The call exceeded its timeout ceiling and was cancelled.
    #[error("request to '{url}' cancelled after {timeout:?}")]
    Timeout {
        /// The request URL.
        url: String,
        /// The ceiling that fired.
        timeout: Duration,
    },

    /// The HTTP request failed for another reason.
    #[error("HTTP request failed: {source}")]
    RequestFailed {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status and no API error envelope.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The API returned `status: error`.
    #[error("query failed ({error_type}): {message}")]
    Api {
        /// Prometheus error type, e.g. `bad_data`.
        error_type: String,
        /// Human-readable message.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response: {source}")]
    Decode {
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The response carried a result type the pipeline does not accept.
    #[error("unexpected result type '{result_type}', expected a matrix")]
    UnexpectedResultType {
        /// The `resultType` returned by the server.
        result_type: String,
    },

    /// The bearer token file could not be read.
    #[error("failed to read bearer token file '{}': {source}", path.display())]
    TokenFile {
        /// The token file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The request signer rejected the request.
    #[error("failed to sign request: {reason}")]
    Signing {
        /// Description of the failure.
        reason: String,
    },
}

impl ClientError {
    /// Returns `true` for errors that mean the backend is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Errors that can occur while merging per-cluster result maps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// The same cluster appeared in two label-filter groups.
    #[error("cluster '{cluster}' produced results in more than one label filter group")]
    DuplicateCluster {
        /// The colliding cluster name.
        cluster: String,
    },
}

/// Errors that can occur while writing workload CSV files.
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// No query variants were supplied.
    #[error("workload '{stem}' has no queries")]
    NoQueries {
        /// The workload file stem.
        stem: String,
    },

    /// An output file already exists; workload files are never reopened.
    #[error("output file '{}' already exists", path.display())]
    FileExists {
        /// The existing file.
        path: PathBuf,
    },

    /// The output directory could not be created.
    #[error("failed to create directory '{}': {source}", path.display())]
    CreateDir {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The output file could not be created.
    #[error("failed to create '{}': {source}", path.display())]
    Create {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A row or the header could not be written.
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur when loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of what is invalid.
        reason: String,
    },
}

/// Type alias for `Result<T, CapstanError>`.
pub type Result<T> = std::result::Result<T, CapstanError>;
