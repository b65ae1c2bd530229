//! CLI for the capstan multi-cluster query collector.
//!
//! Provides commands for checking a configuration, running ad-hoc templated
//! queries and extracting historical workloads to CSV.

use std::path::{Path, PathBuf};

use capstan::duration::{format_duration, parse_duration};
use capstan::workload::{EntityKind, FieldSpec, RangeProvider, Workload, WorkloadQuery, WorkloadWriter};
use capstan::{Collector, CollectorConfig, Platform, PrometheusClient, QueryRange};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// capstan — Multi-cluster Prometheus query collector CLI.
#[derive(Parser)]
#[command(name = "capstan", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short, default_value = "capstan.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and show clusters and filter groups.
    Check,

    /// Run a query template against every cluster.
    Query {
        /// Query template, e.g. `sum(kube_pod_info) by (namespace)`.
        template: String,

        /// Run as a range query over this lookback (e.g., "1h", "30m").
        #[arg(long)]
        range: Option<String>,

        /// Range query resolution. Defaults to the cluster scrape interval,
        /// else the configured default scrape interval.
        #[arg(long)]
        step: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Extract a workload over historical windows to CSV files.
    Collect {
        /// Built-in workload to extract.
        #[arg(long, default_value = "container-cpu")]
        workload: BuiltinWorkload,

        /// End of the most recent window (RFC 3339). Defaults to now.
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Override the configured output directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Show the detected platform and Prometheus build information.
    BuildInfo,
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object keyed by cluster.
    Json,
}

/// Workloads shipped with the CLI.
#[derive(Clone, Copy, ValueEnum)]
enum BuiltinWorkload {
    /// Container CPU usage in millicores.
    ContainerCpu,
    /// Container working-set memory in bytes.
    ContainerMemory,
    /// Container CPU requests in millicores.
    ContainerCpuRequest,
}

impl BuiltinWorkload {
    fn definition(self) -> Workload<'static> {
        let fields = || FieldSpec::new(["namespace", "pod", "container"]);
        let entity = EntityKind::new("container", "cluster,namespace,pod,container,Datetime,%s");
        let (stem, metric_name, templates): (&str, &str, &[&str]) = match self {
            Self::ContainerCpu => (
                "cpu_usage",
                "cpu_mCores",
                &["sum(rate(container_cpu_usage_seconds_total{container!=\"\",container!=\"POD\"}[5m])) by (namespace, pod, container) * 1000"],
            ),
            Self::ContainerMemory => (
                "memory_usage",
                "memory_bytes",
                &["max(container_memory_working_set_bytes{container!=\"\",container!=\"POD\"}) by (namespace, pod, container)"],
            ),
            Self::ContainerCpuRequest => (
                "cpu_request",
                "cpu_request_mCores",
                &[
                    "sum(kube_pod_container_resource_requests{resource=\"cpu\"}) by (namespace, pod, container) * 1000",
                    "sum(kube_pod_container_resource_requests_cpu_cores) by (namespace, pod, container) * 1000",
                ],
            ),
        };
        Workload {
            stem: stem.to_string(),
            metric_name: metric_name.to_string(),
            queries: templates
                .iter()
                .map(|template| WorkloadQuery::new(*template, fields()))
                .collect(),
            entity,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check => cmd_check(&cli.config),
        Commands::Query {
            template,
            range,
            step,
            format,
        } => cmd_query(&cli.config, &template, range.as_deref(), step.as_deref(), &format),
        Commands::Collect {
            workload,
            end,
            output_dir,
        } => cmd_collect(&cli.config, workload, end, output_dir),
        Commands::BuildInfo => cmd_build_info(&cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Loads the configuration and opens a session.
fn open_collector(config_path: &Path) -> Result<(CollectorConfig, Collector), Box<dyn std::error::Error>> {
    let config = CollectorConfig::load(config_path)?;
    if config.prometheus.sigv4 {
        warn!("sigv4 is enabled but the CLI installs no request signer; requests are sent unsigned");
    }
    let api = PrometheusClient::new(&config.prometheus.url, config.prometheus.auth.clone())?;
    let collector = Collector::new(Box::new(api), config.registry()?, config.settings()?);
    Ok((config, collector))
}

/// Implements `capstan check`.
fn cmd_check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = CollectorConfig::load(config_path)?;
    let registry = config.registry()?;
    let c = &config.collection;

    println!("Config: {}", config_path.display());
    println!("Endpoint: {}", config.prometheus.url);
    let endpoint = config.settings()?.endpoint;
    if let Some(url) = &endpoint.url {
        println!("Platform: {}", Platform::classify(url, endpoint.sigv4, endpoint.password_set));
    }
    println!();
    println!("Clusters: {}", registry.len());
    for group in registry.groups() {
        let names = if group.label_names.is_empty() {
            "(catch-all)".to_string()
        } else {
            group.label_names.join(", ")
        };
        println!("  Group [{names}]");
        for cluster in &group.clusters {
            let filter = registry.member_filter(cluster)?;
            println!("    - {cluster}: {{{}}}", filter.labels);
        }
    }
    println!();
    println!(
        "Collection: {} x {} windows, step {}, {} queries, duplicates: {:?}",
        c.history_interval_count,
        format_duration(c.interval),
        format_duration(c.step),
        if c.per_cluster_queries { "per-cluster" } else { "shared" },
        c.duplicate_policy,
    );
    println!("Output: {}", c.output_dir.display());
    Ok(())
}

/// Implements `capstan query <template>`.
fn cmd_query(
    config_path: &Path,
    template: &str,
    range: Option<&str>,
    step: Option<&str>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config, collector) = open_collector(config_path)?;

    let range = match range {
        Some(lookback) => {
            let end = Utc::now();
            let start = end - chrono::Duration::from_std(parse_duration(lookback)?)?;
            let step = step.map(parse_duration).transpose()?;
            Some(
                QueryRange::new(start, end, step)
                    .with_fallback_step(config.collection.default_scrape_interval),
            )
        }
        None => None,
    };

    let execution = collector.execute(template, range.as_ref())?;
    if let Some(err) = &execution.error {
        warn!(error = %err, "results are partial");
    }

    match format {
        OutputFormat::Csv => {
            println!("cluster,labels,timestamp,value");
            for (cluster, result) in &execution.results {
                if let Some(err) = &result.error {
                    eprintln!("# {cluster}: {err}");
                    continue;
                }
                for stream in &result.matrix {
                    let labels: Vec<_> = stream.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    for (ts, value) in &stream.samples {
                        println!(
                            "{cluster},\"{}\",{},{value}",
                            labels.join(";"),
                            ts.to_rfc3339_opts(SecondsFormat::Millis, true)
                        );
                    }
                }
            }
        }
        OutputFormat::Json => {
            let clusters: serde_json::Map<String, serde_json::Value> = execution
                .results
                .iter()
                .map(|(cluster, result)| {
                    let series: Vec<serde_json::Value> = result
                        .matrix
                        .iter()
                        .map(|stream| {
                            serde_json::json!({
                                "labels": stream.labels,
                                "samples": stream
                                    .samples
                                    .iter()
                                    .map(|(ts, v)| serde_json::json!([ts.to_rfc3339(), v]))
                                    .collect::<Vec<_>>(),
                            })
                        })
                        .collect();
                    (
                        cluster.clone(),
                        serde_json::json!({
                            "query": result.query,
                            "error": result.error,
                            "series": series,
                        }),
                    )
                })
                .collect();

            let output = serde_json::json!({
                "template": template,
                "clusters_with_data": execution.clusters_with_data(),
                "clusters": clusters,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `capstan collect`.
fn cmd_collect(
    config_path: &Path,
    workload: BuiltinWorkload,
    end: Option<DateTime<Utc>>,
    output_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config, collector) = open_collector(config_path)?;
    let c = &config.collection;
    let output_dir = output_dir.unwrap_or_else(|| c.output_dir.clone());
    let end = end.unwrap_or_else(Utc::now);

    let definition = workload.definition();
    let provider = RangeProvider::new(end, c.interval, c.step);
    let writer = WorkloadWriter::new(&collector, &output_dir, c.history_interval_count);

    info!(
        stem = %definition.stem,
        windows = c.history_interval_count,
        output = %output_dir.display(),
        "collecting workload"
    );
    let summary = writer.write(&definition, &provider)?;

    println!("Workload: {}", definition.stem);
    println!("  Files: {}", summary.files.len());
    for path in &summary.files {
        println!("    - {}", path.display());
    }
    println!("  Rows: {}", summary.total_rows());
    if !summary.failed.is_empty() {
        println!("  Failed:");
        for (cluster, reason) in &summary.failed {
            println!("    - {cluster}: {reason}");
        }
    }
    Ok(())
}

/// Implements `capstan build-info`.
fn cmd_build_info(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (_, collector) = open_collector(config_path)?;
    println!("Platform: {}", collector.platform());
    println!("Build: {}", collector.build_info()?);
    Ok(())
}
