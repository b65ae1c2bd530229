//! In-memory Prometheus API shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use capstan::client::{ApiValue, Auth, BuildDetails, PrometheusClient, QueryApi};
use capstan::labels::LabelSet;
use capstan::query::{Matrix, SampleStream};
use capstan::ClientError;
use chrono::{DateTime, TimeZone, Utc};

/// Which endpoint a call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Instant,
    Range,
    Exemplars,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub query: String,
    pub step: Option<Duration>,
    pub start: Option<DateTime<Utc>>,
}

/// Shared view of the calls a [`FakePrometheus`] received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Calls other than scrape-interval discovery probes.
    pub fn data_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !c.query.contains("count_over_time"))
            .collect()
    }
}

type Responder = Box<dyn Fn(&str) -> Result<Matrix, ClientError> + Send + Sync>;

/// Answers every query through a closure and records it.
pub struct FakePrometheus {
    log: CallLog,
    respond: Responder,
}

impl FakePrometheus {
    pub fn new<F>(respond: F) -> (Self, CallLog)
    where
        F: Fn(&str) -> Result<Matrix, ClientError> + Send + Sync + 'static,
    {
        let log = CallLog::default();
        (
            Self {
                log: log.clone(),
                respond: Box::new(respond),
            },
            log,
        )
    }

    fn answer(&self, kind: CallKind, query: &str, step: Option<Duration>, start: Option<DateTime<Utc>>) -> Result<ApiValue, ClientError> {
        self.log.push(Call {
            kind,
            query: query.to_string(),
            step,
            start,
        });
        (self.respond)(query).map(ApiValue::Matrix)
    }
}

impl QueryApi for FakePrometheus {
    fn query(&self, query: &str, _: Option<DateTime<Utc>>, _: Duration) -> Result<ApiValue, ClientError> {
        self.answer(CallKind::Instant, query, None, None)
    }

    fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        _: DateTime<Utc>,
        step: Duration,
        _: Duration,
    ) -> Result<ApiValue, ClientError> {
        self.answer(CallKind::Range, query, Some(step), Some(start))
    }

    fn query_exemplars(
        &self,
        query: &str,
        start: DateTime<Utc>,
        _: DateTime<Utc>,
        _: Duration,
    ) -> Result<ApiValue, ClientError> {
        self.answer(CallKind::Exemplars, query, None, Some(start))
    }

    fn build_info(&self, _: Duration) -> Result<BuildDetails, ClientError> {
        Ok(BuildDetails::default())
    }
}

/// A fixed instant for sample timestamps.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// A series with one sample per value, one minute apart starting at [`t0`].
pub fn series(pairs: &[(&str, &str)], values: &[f64]) -> SampleStream {
    let samples = values
        .iter()
        .enumerate()
        .map(|(i, v)| (t0() + chrono::Duration::minutes(i64::try_from(i).unwrap()), *v))
        .collect();
    SampleStream::new(labels(pairs), samples)
}

/// A real connection-refused error from the HTTP client.
pub fn connection_refused() -> ClientError {
    let client = PrometheusClient::new("http://127.0.0.1:9", Auth::None).unwrap();
    let err = client.query("up", None, Duration::from_secs(5)).unwrap_err();
    assert!(err.is_connectivity(), "expected a connectivity error, got {err}");
    err
}
