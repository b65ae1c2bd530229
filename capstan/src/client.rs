//! Prometheus HTTP API client.
//!
//! [`QueryApi`] is the seam between the collection engine and the backend.
//! [`PrometheusClient`] implements it over a blocking `reqwest` client;
//! tests substitute an in-memory implementation.
//!
//! Every call takes an explicit timeout that is applied to the request
//! itself, so a single unresponsive query cannot stall a batch. Data
//! queries use [`DATA_QUERY_TIMEOUT`], metadata calls [`METADATA_TIMEOUT`].
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan::client::{Auth, PrometheusClient, QueryApi, DATA_QUERY_TIMEOUT};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PrometheusClient::new("http://localhost:9090", Auth::None)?;
//! let value = client.query("up", None, DATA_QUERY_TIMEOUT)?;
//! println!("{} series", value.into_matrix()?.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::duration::format_duration;
use crate::error::ClientError;
use crate::labels::LabelSet;
use crate::query::{Matrix, Sample, SampleStream};

/// Timeout ceiling for data queries.
pub const DATA_QUERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout ceiling for metadata calls such as build info.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// A decoded query result value.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiValue {
    /// Series with many samples each.
    Matrix(Matrix),
    /// Series with one sample each.
    Vector(Vec<(LabelSet, Sample)>),
    /// A single number.
    Scalar(Sample),
    /// A single string.
    String(DateTime<Utc>, String),
}

impl ApiValue {
    /// The Prometheus `resultType` name.
    pub fn result_type(&self) -> &'static str {
        match self {
            Self::Matrix(_) => "matrix",
            Self::Vector(_) => "vector",
            Self::Scalar(_) => "scalar",
            Self::String(..) => "string",
        }
    }

    /// Converts the value into a matrix.
    ///
    /// A vector becomes one single-sample stream per series.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnexpectedResultType`] for scalars and strings.
    pub fn into_matrix(self) -> Result<Matrix, ClientError> {
        match self {
            Self::Matrix(matrix) => Ok(matrix),
            Self::Vector(samples) => Ok(samples
                .into_iter()
                .map(|(labels, sample)| SampleStream::new(labels, vec![sample]))
                .collect()),
            other => Err(ClientError::UnexpectedResultType {
                result_type: other.result_type().to_string(),
            }),
        }
    }
}

/// Server build information from `/api/v1/status/buildinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildDetails {
    /// Server version, e.g. `2.53.0`.
    pub version: String,
    /// Source revision.
    pub revision: String,
    /// Source branch.
    pub branch: String,
    /// Go toolchain used to build the server.
    pub go_version: String,
}

/// Build information, or a placeholder where the platform has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInfo {
    /// The server reported its build.
    Detected(BuildDetails),
    /// The platform does not serve build information.
    NotDetected,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detected(details) => write!(f, "{} ({})", details.version, details.revision),
            Self::NotDetected => f.write_str("not detected for this platform"),
        }
    }
}

/// Operations the collection engine needs from a Prometheus-compatible API.
pub trait QueryApi: Send + Sync {
    /// Runs an instant query at `time`, or now.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the call fails or cannot be decoded.
    fn query(
        &self,
        query: &str,
        time: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError>;

    /// Runs a range query.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the call fails or cannot be decoded.
    fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError>;

    /// Fetches exemplars, returned as one stream per exemplar series.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the call fails or cannot be decoded.
    fn query_exemplars(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError>;

    /// Fetches server build information.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the call fails or cannot be decoded.
    fn build_info(&self, timeout: Duration) -> Result<BuildDetails, ClientError>;
}

/// How requests authenticate.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    /// No authentication.
    #[default]
    None,
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// A bearer token given inline.
    Bearer {
        /// The token.
        token: String,
    },
    /// A bearer token read from a file on every request.
    BearerFile {
        /// Path to the token file.
        path: PathBuf,
    },
}

impl Auth {
    /// Returns `true` if a password is configured.
    pub fn has_password(&self) -> bool {
        matches!(self, Self::Basic { password, .. } if !password.is_empty())
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f.debug_struct("Bearer").field("token", &"<redacted>").finish(),
            Self::BearerFile { path } => f.debug_struct("BearerFile").field("path", path).finish(),
        }
    }
}

/// Signs a fully built request before it is sent.
///
/// Used for endpoints that require request signing, such as SigV4.
pub trait RequestSigner: Send + Sync {
    /// Adds signature headers to `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Signing`] if the request cannot be signed.
    fn sign(&self, request: &mut reqwest::blocking::Request) -> Result<(), ClientError>;
}

/// Blocking Prometheus HTTP API client.
pub struct PrometheusClient {
    endpoint: Url,
    http: reqwest::blocking::Client,
    auth: Auth,
    signer: Option<Box<dyn RequestSigner>>,
}

impl fmt::Debug for PrometheusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("auth", &self.auth)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl PrometheusClient {
    /// Creates a client for the API rooted at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidEndpoint`] if the URL does not parse and
    /// [`ClientError::ClientCreate`] if the HTTP client cannot be built.
    pub fn new(endpoint: &str, auth: Auth) -> Result<Self, ClientError> {
        let endpoint = Url::parse(endpoint).map_err(|source| ClientError::InvalidEndpoint {
            url: endpoint.to_string(),
            source,
        })?;
        let http = reqwest::blocking::Client::builder()
            .build()
            .map_err(|source| ClientError::ClientCreate { source })?;
        Ok(Self {
            endpoint,
            http,
            auth,
            signer: None,
        })
    }

    /// Installs a request signer.
    pub fn with_signer(mut self, signer: Box<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// The API root.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        let joined = format!("{}/{}", self.endpoint.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|source| ClientError::InvalidEndpoint { url: joined, source })
    }

    fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let url = self.url(path)?;
        debug!(%url, ?params, "prometheus request");

        let builder = self.http.get(url.clone()).query(params).timeout(timeout);
        let builder = match &self.auth {
            Auth::None => builder,
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Bearer { token } => builder.bearer_auth(token),
            Auth::BearerFile { path: token_path } => {
                let token =
                    std::fs::read_to_string(token_path).map_err(|source| ClientError::TokenFile {
                        path: token_path.clone(),
                        source,
                    })?;
                builder.bearer_auth(token.trim())
            }
        };
        let mut request = builder
            .build()
            .map_err(|source| ClientError::RequestFailed { source })?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut request)?;
        }

        let response = self
            .http
            .execute(request)
            .map_err(|e| transport_error(e, &url, timeout))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| transport_error(e, &url, timeout))?;

        decode_envelope(status.as_u16(), &body)
    }
}

fn transport_error(error: reqwest::Error, url: &Url, timeout: Duration) -> ClientError {
    if error.is_timeout() {
        ClientError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else if error.is_connect() {
        ClientError::Connect {
            url: url.to_string(),
            source: error,
        }
    } else {
        ClientError::RequestFailed { source: error }
    }
}

impl QueryApi for PrometheusClient {
    fn query(
        &self,
        query: &str,
        time: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(time) = time {
            params.push(("time", unix_seconds(time)));
        }
        let data: QueryData = self.get("api/v1/query", &params, timeout)?;
        data.into_value()
    }

    fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError> {
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(start)),
            ("end", unix_seconds(end)),
            ("step", format_duration(step)),
        ];
        let data: QueryData = self.get("api/v1/query_range", &params, timeout)?;
        data.into_value()
    }

    fn query_exemplars(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<ApiValue, ClientError> {
        let params = [
            ("query", query.to_string()),
            ("start", unix_seconds(start)),
            ("end", unix_seconds(end)),
        ];
        let data: Vec<RawExemplarSeries> = self.get("api/v1/query_exemplars", &params, timeout)?;
        let matrix = data
            .into_iter()
            .map(|series| -> Result<SampleStream, ClientError> {
                let samples = series
                    .exemplars
                    .into_iter()
                    .map(|e| decode_sample((e.timestamp, e.value)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SampleStream::new(series.series_labels, samples))
            })
            .collect::<Result<Matrix, ClientError>>()?;
        Ok(ApiValue::Matrix(matrix))
    }

    fn build_info(&self, timeout: Duration) -> Result<BuildDetails, ClientError> {
        self.get("api/v1/status/buildinfo", &[], timeout)
    }
}

/// The Prometheus API response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn decode_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, ClientError> {
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !(200..300).contains(&status) => {
            return Err(ClientError::HttpStatus {
                status,
                body: body.to_string(),
            });
        }
        Err(source) => return Err(ClientError::Decode { source }),
    };

    if envelope.status != "success" {
        return Err(ClientError::Api {
            error_type: envelope.error_type.unwrap_or_default(),
            message: envelope.error.unwrap_or_default(),
        });
    }
    envelope.data.ok_or_else(|| ClientError::Decode {
        source: decode_error("response has no data"),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    #[serde(default)]
    metric: LabelSet,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(default)]
    metric: LabelSet,
    value: (f64, String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExemplarSeries {
    #[serde(default)]
    series_labels: LabelSet,
    #[serde(default)]
    exemplars: Vec<RawExemplar>,
}

#[derive(Debug, Deserialize)]
struct RawExemplar {
    value: String,
    timestamp: f64,
}

impl QueryData {
    fn into_value(self) -> Result<ApiValue, ClientError> {
        let decode = |source| ClientError::Decode { source };
        match self.result_type.as_str() {
            "matrix" => {
                let raw: Vec<RawSeries> = serde_json::from_value(self.result).map_err(decode)?;
                let matrix = raw
                    .into_iter()
                    .map(|series| -> Result<SampleStream, ClientError> {
                        let samples = series
                            .values
                            .into_iter()
                            .map(decode_sample)
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(SampleStream::new(series.metric, samples))
                    })
                    .collect::<Result<Matrix, ClientError>>()?;
                Ok(ApiValue::Matrix(matrix))
            }
            "vector" => {
                let raw: Vec<RawSample> = serde_json::from_value(self.result).map_err(decode)?;
                let vector = raw
                    .into_iter()
                    .map(|s| -> Result<_, ClientError> { Ok((s.metric, decode_sample(s.value)?)) })
                    .collect::<Result<Vec<_>, ClientError>>()?;
                Ok(ApiValue::Vector(vector))
            }
            "scalar" => {
                let raw: (f64, String) = serde_json::from_value(self.result).map_err(decode)?;
                Ok(ApiValue::Scalar(decode_sample(raw)?))
            }
            "string" => {
                let (ts, text): (f64, String) = serde_json::from_value(self.result).map_err(decode)?;
                Ok(ApiValue::String(decode_timestamp(ts)?, text))
            }
            other => Err(ClientError::UnexpectedResultType {
                result_type: other.to_string(),
            }),
        }
    }
}

fn decode_sample((ts, value): (f64, String)) -> Result<Sample, ClientError> {
    let value = parse_value(&value).ok_or_else(|| ClientError::Decode {
        source: decode_error(&format!("invalid sample value '{value}'")),
    })?;
    Ok((decode_timestamp(ts)?, value))
}

#[allow(clippy::cast_possible_truncation)] // millisecond epoch fits in i64
fn decode_timestamp(ts: f64) -> Result<DateTime<Utc>, ClientError> {
    DateTime::from_timestamp_millis((ts * 1000.0).round() as i64).ok_or_else(|| ClientError::Decode {
        source: decode_error(&format!("timestamp {ts} out of range")),
    })
}

/// Parses a Prometheus sample value, including `NaN` and `±Inf`.
fn parse_value(value: &str) -> Option<f64> {
    match value {
        "NaN" => Some(f64::NAN),
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn decode_error(message: &str) -> serde_json::Error {
    <serde_json::Error as serde::de::Error>::custom(message)
}

fn unix_seconds(time: DateTime<Utc>) -> String {
    let millis = time.timestamp_millis();
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}
