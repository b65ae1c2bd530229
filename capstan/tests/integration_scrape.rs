//! Integration tests for scrape-interval discovery and window adjustment.
//!
//! Discovery probes are answered by an in-memory API; the resulting table
//! drives the rewriting of range windows in cluster-bound queries.

mod support;

use std::time::Duration;

use capstan::collector::{Collector, CollectorSettings};
use capstan::labels::{ClusterFilterSpec, FilterRegistry};
use capstan::query::QueryRange;
use support::{CallKind, FakePrometheus, series, t0};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn settings() -> CollectorSettings {
    CollectorSettings {
        // Distinct from anything discovery can produce below.
        default_scrape_interval: secs(30),
        ..CollectorSettings::default()
    }
}

#[test]
fn test_sixty_samples_per_hour_widens_window_by_a_minute() {
    let registry = FilterRegistry::from_specs([ClusterFilterSpec::new("prod", [("env", "prod")])]).unwrap();
    let (api, log) = FakePrometheus::new(|query| {
        Ok(if query.contains("count_over_time(up{") {
            vec![series(&[("env", "prod"), ("job", "app")], &[60.0])]
        } else {
            vec![]
        })
    });
    let collector = Collector::new(Box::new(api), registry, settings());

    let range = QueryRange::new(t0() - chrono::Duration::hours(1), t0(), None);
    let execution = collector.execute("rate(metric[30s])", Some(&range)).unwrap();

    let query = &execution.results["prod"].query;
    assert_eq!(query, r#"rate(metric{env="prod"}[1m30s])"#);

    let data = log.data_calls();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].kind, CallKind::Range);
    assert_eq!(data[0].step, Some(secs(60)));

    let table = collector.scrape_table().unwrap();
    assert_eq!(table.interval_for("prod", "metric"), secs(60));
}

#[test]
fn test_exporter_interval_is_per_cluster() {
    let registry = FilterRegistry::from_specs([
        ClusterFilterSpec::new("fast", [("cluster", "fast")]),
        ClusterFilterSpec::new("slow", [("cluster", "slow")]),
    ])
    .unwrap();
    let (api, _) = FakePrometheus::new(|query| {
        if !query.contains("count_over_time(container_cpu_usage_seconds_total{") {
            return Ok(vec![]);
        }
        // 240 samples per hour is 15s; 60 per hour is 1m.
        Ok(if query.contains(r#""fast""#) {
            vec![
                series(&[("cluster", "fast"), ("job", "kubelet")], &[240.0]),
                series(&[("cluster", "fast"), ("job", "cadvisor-slow")], &[12.0]),
            ]
        } else {
            vec![series(&[("cluster", "slow"), ("job", "kubelet")], &[60.0])]
        })
    });
    let collector = Collector::new(Box::new(api), registry, settings());

    let execution = collector
        .execute("sum(increase(container_cpu_cfs_throttled_periods_total[5m])) by (pod)", None)
        .unwrap();

    assert!(execution.results["fast"].query.contains("[5m15s]"));
    assert!(execution.results["slow"].query.contains("[6m]"));

    let table = collector.scrape_table().unwrap();
    let fast = &table.cluster("fast").unwrap().exporters["container"];
    assert_eq!(fast.job_name.as_deref(), Some("kubelet"));
    assert_eq!(fast.actual_scrape_interval, Some(secs(15)));

    // Nothing discovered for kube-state-metrics: the default applies.
    assert_eq!(table.interval_for("fast", "kube"), secs(30));
}

#[test]
fn test_multiplier_windows() {
    let registry = FilterRegistry::from_specs([ClusterFilterSpec::new("prod", [("env", "prod")])]).unwrap();
    let (api, _) = FakePrometheus::new(|query| {
        Ok(if query.contains("count_over_time(up{") {
            vec![series(&[("env", "prod"), ("job", "kubelet")], &[120.0])]
        } else {
            vec![]
        })
    });
    let collector = Collector::new(Box::new(api), registry, settings());

    let execution = collector
        .execute(r#"changes(kube_pod_container_status_restarts_total{namespace="a"}[*4])"#, None)
        .unwrap();
    assert_eq!(
        execution.results["prod"].query,
        r#"changes(kube_pod_container_status_restarts_total{namespace="a",env="prod"}[2m])"#
    );
}
