//! Historical-window workload extraction to CSV.
//!
//! A workload is one logical metric written to one CSV file per cluster. The
//! writer walks `history_interval_count` windows from the most recent to the
//! oldest, runs every query variant for each window and appends a row per
//! retained sample. Newest first means a deep-history timeout still leaves
//! the recent data on disk.
//!
//! # File lifecycle
//!
//! Output goes to `<output_dir>/<cluster>/<entity>/<stem>.csv`. A file is
//! created on the first row for its cluster, never truncated or reopened,
//! and closed after the last window. An existing file is an error for that
//! cluster only. A write failure abandons the rest of that file; other
//! clusters carry on.
//!
//! # Row format
//!
//! ```text
//! <cluster>,<field>...,<timestamp>,<value>...
//! ```
//!
//! Timestamps are RFC 3339 in UTC with millisecond precision. An unknown
//! value is written as an empty field. Rows holding NaN or an infinity are
//! skipped.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error, info, warn};

use crate::collector::Collector;
use crate::error::{Result, WorkloadError};
use crate::labels::LabelSet;
use crate::query::{QueryRange, Sample};

/// Supplies the time range of each window and decodes samples into rows.
pub trait QueryProvider {
    /// The range of window `history_index`, where 0 is the most recent.
    fn calculate_range(&self, history_index: u32) -> QueryRange;

    /// Decodes a sample into a row timestamp and values.
    ///
    /// Returns `None` to skip the sample.
    fn time_and_values(&self, sample: &Sample) -> Option<(DateTime<Utc>, Vec<Option<f64>>)>;
}

/// Consecutive, non-overlapping windows ending at `end`.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use chrono::{TimeZone, Utc};
/// use capstan::workload::{QueryProvider, RangeProvider};
///
/// let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
/// let provider = RangeProvider::new(end, Duration::from_secs(3600), Duration::from_secs(300));
///
/// let second = provider.calculate_range(1);
/// assert_eq!(second.end, Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap());
/// assert_eq!(second.start, Utc.with_ymd_and_hms(2024, 1, 1, 22, 5, 0).unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeProvider {
    /// End of the most recent window.
    pub end: DateTime<Utc>,
    /// Length of each window.
    pub window: Duration,
    /// Query resolution.
    pub step: Duration,
}

impl RangeProvider {
    /// Creates a provider.
    pub fn new(end: DateTime<Utc>, window: Duration, step: Duration) -> Self {
        Self { end, window, step }
    }
}

impl QueryProvider for RangeProvider {
    fn calculate_range(&self, history_index: u32) -> QueryRange {
        let window = chrono::Duration::from_std(self.window).unwrap_or_default();
        let step = chrono::Duration::from_std(self.step).unwrap_or_default();
        let back = i32::try_from(history_index)
            .ok()
            .and_then(|n| window.checked_mul(n))
            .unwrap_or_default();
        let end = self.end - back;
        // Ranges are inclusive at both ends; start one step in so windows
        // do not share a sample.
        let start = end - window + step;
        QueryRange::new(start, end, Some(self.step))
    }

    fn time_and_values(&self, (ts, value): &Sample) -> Option<(DateTime<Utc>, Vec<Option<f64>>)> {
        Some((*ts, vec![Some(*value)]))
    }
}

/// A decoded event sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedEvent {
    /// When the event happened, in whole seconds.
    pub time: DateTime<Utc>,
    /// How many times it happened, below 100.
    pub count: u32,
    /// Exit code, present only when the terminated flag is set.
    pub exit_code: Option<u32>,
}

impl PackedEvent {
    const SECONDS: u64 = 1_000_000;
    const COUNT: u64 = 10_000;
    const EXIT_CODE: u64 = 10;

    /// Packs an event into a sample value.
    ///
    /// `packed = seconds * 1e6 + count * 1e4 + exit_code * 10 + terminated`
    #[allow(clippy::cast_precision_loss)] // below 2^53 until the year 2255
    pub fn pack(&self) -> f64 {
        let seconds = u64::try_from(self.time.timestamp()).unwrap_or_default();
        let (exit, flag) = self.exit_code.map_or((0, 0), |code| (u64::from(code), 1));
        (seconds * Self::SECONDS + u64::from(self.count) * Self::COUNT + exit * Self::EXIT_CODE + flag) as f64
    }

    /// Decodes a packed sample value.
    ///
    /// Returns `None` for negative, fractional or non-finite values.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn unpack(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
            return None;
        }
        let packed = value as u64;
        let seconds = packed / Self::SECONDS;
        let rest = packed % Self::SECONDS;
        let count = rest / Self::COUNT;
        let rest = rest % Self::COUNT;
        let exit_code = rest / Self::EXIT_CODE;
        let terminated = rest % Self::EXIT_CODE;

        Some(Self {
            time: DateTime::from_timestamp(i64::try_from(seconds).ok()?, 0)?,
            count: count as u32,
            exit_code: (terminated != 0).then_some(exit_code as u32),
        })
    }
}

/// Windows like [`RangeProvider`], with samples decoded as packed events.
///
/// Each row carries the event's own time, its count and its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventProvider {
    /// The window layout.
    pub ranges: RangeProvider,
}

impl EventProvider {
    /// Creates a provider.
    pub fn new(ranges: RangeProvider) -> Self {
        Self { ranges }
    }
}

impl QueryProvider for EventProvider {
    fn calculate_range(&self, history_index: u32) -> QueryRange {
        self.ranges.calculate_range(history_index)
    }

    fn time_and_values(&self, (_, value): &Sample) -> Option<(DateTime<Utc>, Vec<Option<f64>>)> {
        let event = PackedEvent::unpack(*value)?;
        Some((
            event.time,
            vec![Some(f64::from(event.count)), event.exit_code.map(f64::from)],
        ))
    }
}

/// Label names that must all be present on a series, in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSpec {
    /// Required label names.
    pub labels: Vec<String>,
}

impl FieldSpec {
    /// Creates a spec from label names.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Extracts the field values, or `None` if any label is missing.
    pub fn extract(&self, labels: &LabelSet) -> Option<Vec<String>> {
        self.labels
            .iter()
            .map(|name| labels.get(name).cloned())
            .collect()
    }
}

/// Rewrites or vetoes extracted fields: `(cluster, fields) -> fields`.
pub type FieldsFunc<'a> = Box<dyn Fn(&str, &[String]) -> Option<Vec<String>> + 'a>;

/// The kind of entity a workload describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKind {
    /// Directory name under each cluster, e.g. `container`.
    pub name: String,
    /// CSV header; `%s` is replaced by the metric display name.
    pub header_template: String,
}

impl EntityKind {
    /// Creates an entity kind.
    pub fn new(name: impl Into<String>, header_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header_template: header_template.into(),
        }
    }

    /// Renders the header for a metric.
    pub fn header(&self, metric_name: &str) -> String {
        self.header_template.replace("%s", metric_name)
    }
}

/// One query variant of a workload.
pub struct WorkloadQuery<'a> {
    /// The query template.
    pub template: String,
    /// Labels to extract from each series.
    pub fields: FieldSpec,
    /// Optional conversion of extracted fields.
    pub convert: Option<FieldsFunc<'a>>,
}

impl<'a> WorkloadQuery<'a> {
    /// Creates a variant without conversion.
    pub fn new(template: impl Into<String>, fields: FieldSpec) -> Self {
        Self {
            template: template.into(),
            fields,
            convert: None,
        }
    }

    /// Adds a field conversion.
    pub fn with_convert<F>(mut self, convert: F) -> Self
    where
        F: Fn(&str, &[String]) -> Option<Vec<String>> + 'a,
    {
        self.convert = Some(Box::new(convert));
        self
    }

    fn fields_for(&self, cluster: &str, labels: &LabelSet) -> Option<Vec<String>> {
        let fields = self.fields.extract(labels)?;
        match &self.convert {
            Some(convert) => convert(cluster, &fields),
            None => Some(fields),
        }
    }
}

/// A logical metric written to one file per cluster.
pub struct Workload<'a> {
    /// File name stem.
    pub stem: String,
    /// Display name substituted into the header.
    pub metric_name: String,
    /// Query variants, all written to the same file.
    pub queries: Vec<WorkloadQuery<'a>>,
    /// Entity kind, deciding directory and header.
    pub entity: EntityKind,
}

/// What a workload pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadSummary {
    /// Rows written per cluster.
    pub rows: BTreeMap<String, usize>,
    /// Files created, in creation order.
    pub files: Vec<PathBuf>,
    /// Clusters whose file failed, with the reason.
    pub failed: BTreeMap<String, String>,
}

impl WorkloadSummary {
    /// Total rows written.
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

enum OutputFile<W> {
    Open { path: PathBuf, writer: W },
    Failed,
}

/// Runs workloads over historical windows and writes CSV files.
#[derive(Debug)]
pub struct WorkloadWriter<'c> {
    collector: &'c Collector,
    output_dir: PathBuf,
    history_interval_count: u32,
}

impl<'c> WorkloadWriter<'c> {
    /// Creates a writer.
    pub fn new(collector: &'c Collector, output_dir: impl Into<PathBuf>, history_interval_count: u32) -> Self {
        Self {
            collector,
            output_dir: output_dir.into(),
            history_interval_count,
        }
    }

    /// Path of the file for a cluster and workload.
    pub fn output_path(&self, cluster: &str, workload: &Workload<'_>) -> PathBuf {
        self.output_dir
            .join(cluster)
            .join(&workload.entity.name)
            .join(format!("{}.csv", workload.stem))
    }

    /// Runs a workload over every window, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::NoQueries`] if the workload has no variants
    /// and propagates fatal pipeline errors. File errors are logged and
    /// recorded in [`WorkloadSummary::failed`].
    pub fn write(&self, workload: &Workload<'_>, provider: &dyn QueryProvider) -> Result<WorkloadSummary> {
        if workload.queries.is_empty() {
            return Err(WorkloadError::NoQueries {
                stem: workload.stem.clone(),
            }
            .into());
        }

        let mut files: BTreeMap<String, OutputFile<BufWriter<File>>> = BTreeMap::new();
        let mut summary = WorkloadSummary::default();

        for history_index in 0..self.history_interval_count {
            let range = provider.calculate_range(history_index);
            debug!(stem = %workload.stem, history_index, start = %range.start, end = %range.end, "workload window");

            for variant in &workload.queries {
                let execution = self.collector.execute(&variant.template, Some(&range))?;
                if let Some(err) = &execution.error {
                    warn!(stem = %workload.stem, error = %err, "workload window has partial results");
                }

                for (cluster, result) in &execution.results {
                    if result.error.is_some() {
                        continue;
                    }
                    for stream in &result.matrix {
                        let Some(fields) = variant.fields_for(cluster, &stream.labels) else {
                            continue;
                        };
                        for sample in &stream.samples {
                            let Some((ts, values)) = provider.time_and_values(sample) else {
                                continue;
                            };
                            if values.iter().flatten().any(|v| !v.is_finite()) {
                                continue;
                            }
                            let row = format_row(cluster, &fields, ts, &values);
                            self.write_row(&mut files, &mut summary, cluster, workload, &row);
                        }
                    }
                }
            }
        }

        for (cluster, file) in files {
            if let OutputFile::Open { path, mut writer } = file
                && let Err(source) = writer.flush()
            {
                let err = WorkloadError::Write { path, source };
                error!(cluster = %cluster, error = %err, "failed to close workload file");
                summary.failed.insert(cluster, err.to_string());
            }
        }

        info!(
            stem = %workload.stem,
            files = summary.files.len(),
            rows = summary.total_rows(),
            failed = summary.failed.len(),
            "workload complete"
        );
        Ok(summary)
    }

    fn write_row(
        &self,
        files: &mut BTreeMap<String, OutputFile<BufWriter<File>>>,
        summary: &mut WorkloadSummary,
        cluster: &str,
        workload: &Workload<'_>,
        row: &str,
    ) {
        append_row(files, summary, cluster, row, || {
            let path = self.output_path(cluster, workload);
            let writer = open_output(&path, &workload.entity.header(&workload.metric_name))?;
            Ok((path, writer))
        });
    }
}

/// Appends a row to a cluster's file, opening it on first use.
///
/// A cluster whose file cannot be opened or written is marked failed and
/// receives no further rows.
fn append_row<W, F>(
    files: &mut BTreeMap<String, OutputFile<W>>,
    summary: &mut WorkloadSummary,
    cluster: &str,
    row: &str,
    open: F,
) where
    W: Write,
    F: FnOnce() -> std::result::Result<(PathBuf, W), WorkloadError>,
{
    if !files.contains_key(cluster) {
        let file = match open() {
            Ok((path, writer)) => {
                summary.files.push(path.clone());
                OutputFile::Open { path, writer }
            }
            Err(err) => {
                error!(cluster, error = %err, "cannot open workload file");
                summary.failed.insert(cluster.to_string(), err.to_string());
                OutputFile::Failed
            }
        };
        files.insert(cluster.to_string(), file);
    }

    let Some(OutputFile::Open { path, writer }) = files.get_mut(cluster) else {
        return;
    };
    if let Err(source) = writeln!(writer, "{row}") {
        let err = WorkloadError::Write {
            path: path.clone(),
            source,
        };
        error!(cluster, error = %err, "abandoning workload file");
        summary.failed.insert(cluster.to_string(), err.to_string());
        files.insert(cluster.to_string(), OutputFile::Failed);
        return;
    }
    *summary.rows.entry(cluster.to_string()).or_default() += 1;
}

fn open_output(path: &Path, header: &str) -> std::result::Result<BufWriter<File>, WorkloadError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| WorkloadError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let file = File::create_new(path).map_err(|source| match source.kind() {
        io::ErrorKind::AlreadyExists => WorkloadError::FileExists {
            path: path.to_path_buf(),
        },
        _ => WorkloadError::Create {
            path: path.to_path_buf(),
            source,
        },
    })?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{header}").map_err(|source| WorkloadError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(writer)
}

/// Formats one CSV row.
pub fn format_row(cluster: &str, fields: &[String], ts: DateTime<Utc>, values: &[Option<f64>]) -> String {
    let mut cells: Vec<String> = Vec::with_capacity(2 + fields.len() + values.len());
    cells.push(escape_cell(cluster));
    cells.extend(fields.iter().map(|f| escape_cell(f)));
    cells.push(ts.to_rfc3339_opts(SecondsFormat::Millis, true));
    cells.extend(values.iter().map(|v| v.map(|v| v.to_string()).unwrap_or_default()));
    cells.join(",")
}

fn escape_cell(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
