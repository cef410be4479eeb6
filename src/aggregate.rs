//! Reduce the history of a replica group to one scalar per container and signal.
//!
//! Every signal is a single instant query over the whole pod set, evaluated at the
//! same timestamp, with the trailing window expressed inside the query:
//!
//! | signal         | query                                                             |
//! |----------------|-------------------------------------------------------------------|
//! | request cpu    | `avg by (container) (quantile_over_time(q, cpu{sel}[w]))`         |
//! | limit cpu      | `max by (container) (max_over_time(cpu{sel}[w])) * margin`        |
//! | request memory | `avg by (container) (quantile_over_time(q, memory{sel}[w]))`      |
//! | limit memory   | `max by (container) (max_over_time(memory{sel}[w])) * margin`     |
//!
//! Requests follow the typical load of a pod of the group, limits the worst pod.

use crate::Error;
use crate::metrics::{MetricsBackend, Sample};
use crate::workload::ReplicaGroup;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, instrument, warn};

pub const DEFAULT_CPU_METRIC: &str =
    "node_namespace_pod_container:container_cpu_usage_seconds_total:sum_irate";
pub const MEMORY_METRIC: &str = "container_memory_working_set_bytes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    RequestCpu,
    LimitCpu,
    RequestMemory,
    LimitMemory,
}

impl Signal {
    pub const ALL: [Signal; 4] = [
        Signal::RequestCpu,
        Signal::LimitCpu,
        Signal::RequestMemory,
        Signal::LimitMemory,
    ];

    pub fn is_limit(self) -> bool {
        matches!(self, Signal::LimitCpu | Signal::LimitMemory)
    }

    pub fn is_cpu(self) -> bool {
        matches!(self, Signal::RequestCpu | Signal::LimitCpu)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestCpu => "cpu request",
            Self::LimitCpu => "cpu limit",
            Self::RequestMemory => "memory request",
            Self::LimitMemory => "memory limit",
        };
        f.write_str(s)
    }
}

/// Units of a prometheus duration, from the largest to the smallest, with their length in ms.
const WINDOW_UNITS: [(&str, u64); 7] = [
    ("y", 365 * 86_400_000),
    ("w", 7 * 86_400_000),
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

/// A trailing window, kept in prometheus duration syntax (`1w`, `1d12h`, `90m`).
///
/// Units must appear at most once, from the largest to the smallest, like
/// prometheus expects them.
#[derive(Debug, Clone)]
pub struct Window {
    text: String,
}

impl Window {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Default for Window {
    fn default() -> Self {
        Window {
            text: "1w".to_string(),
        }
    }
}

impl FromStr for Window {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidOption {
            name: "window".to_string(),
            reason: format!("'{}' {}", s, reason),
        };
        let text = s.trim();
        let mut rest = text;
        let mut total_ms: u64 = 0;
        let mut last_unit: Option<usize> = None;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(invalid("expects <number><unit> pairs, like 1w or 1d12h"));
            }
            let amount: u64 = rest[..digits]
                .parse()
                .map_err(|_| invalid("has a number out of range"))?;
            rest = &rest[digits..];
            let unit_len = rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(rest.len());
            let Some(unit) = WINDOW_UNITS
                .iter()
                .position(|(label, _)| *label == &rest[..unit_len])
            else {
                return Err(invalid("has an unknown unit, use one of y, w, d, h, m, s, ms"));
            };
            if last_unit.is_some_and(|last| unit <= last) {
                return Err(invalid("repeats a unit or is not ordered as y, w, d, h, m, s, ms"));
            }
            last_unit = Some(unit);
            let unit_ms = WINDOW_UNITS[unit].1;
            rest = &rest[unit_len..];
            total_ms = amount
                .checked_mul(unit_ms)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| invalid("is too long"))?;
        }
        if total_ms == 0 {
            return Err(invalid("is empty"));
        }
        Ok(Window {
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub window: Window,
    pub quantile: f64,
    pub limit_margin: f64,
    pub cpu_metric: String,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        AggregationSettings {
            window: Window::default(),
            quantile: 0.9,
            limit_margin: 1.2,
            cpu_metric: DEFAULT_CPU_METRIC.to_string(),
        }
    }
}

/// Measured usage of one container, in cores and bytes.
///
/// `None` means the backend returned no sample for that signal: undetermined, not zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerUsage {
    pub request_cpu: Option<f64>,
    pub limit_cpu: Option<f64>,
    pub request_memory: Option<f64>,
    pub limit_memory: Option<f64>,
}

impl ContainerUsage {
    pub fn get(&self, signal: Signal) -> Option<f64> {
        match signal {
            Signal::RequestCpu => self.request_cpu,
            Signal::LimitCpu => self.limit_cpu,
            Signal::RequestMemory => self.request_memory,
            Signal::LimitMemory => self.limit_memory,
        }
    }

    fn slot(&mut self, signal: Signal) -> &mut Option<f64> {
        match signal {
            Signal::RequestCpu => &mut self.request_cpu,
            Signal::LimitCpu => &mut self.limit_cpu,
            Signal::RequestMemory => &mut self.request_memory,
            Signal::LimitMemory => &mut self.limit_memory,
        }
    }
}

/// Usage keyed by container name, for a single workload.
pub type UsageByContainer = BTreeMap<String, ContainerUsage>;

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_regex(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Series selector matching the containers of every pod of the group.
pub fn pod_selector(group: &ReplicaGroup) -> String {
    let pods = group
        .pods
        .iter()
        .map(|pod| escape_regex(pod))
        .collect::<Vec<_>>()
        .join("|");
    format!(
        r#"namespace="{}", pod=~"{}", container!="", container!="POD""#,
        escape_label_value(&group.namespace),
        escape_label_value(&pods)
    )
}

pub fn build_query(signal: Signal, selector: &str, settings: &AggregationSettings) -> String {
    let metric = if signal.is_cpu() {
        settings.cpu_metric.as_str()
    } else {
        MEMORY_METRIC
    };
    let window = settings.window.as_str();
    if signal.is_limit() {
        format!(
            "max by (container) (max_over_time({}{{{}}}[{}])) * {}",
            metric, selector, window, settings.limit_margin
        )
    } else {
        format!(
            "avg by (container) (quantile_over_time({}, {}{{{}}}[{}]))",
            settings.quantile, metric, selector, window
        )
    }
}

/// Query the four signals of a replica group, one query at a time.
///
/// A group without pods is not queried: every container stays undetermined.
#[instrument(skip(backend, group, settings), fields(namespace = %group.namespace, replica_set = %group.replica_set))]
pub async fn aggregate<B: MetricsBackend>(
    backend: &B,
    group: &ReplicaGroup,
    settings: &AggregationSettings,
    at: DateTime<Utc>,
) -> Result<UsageByContainer, Error> {
    let mut usage = UsageByContainer::new();
    if group.pods.is_empty() {
        warn!("no running pod, usage undetermined");
        return Ok(usage);
    }
    let selector = pod_selector(group);
    for signal in Signal::ALL {
        let query = build_query(signal, &selector, settings);
        debug!(%signal, %query, "query");
        let samples = backend.query(&query, at).await?;
        merge_samples(&mut usage, signal, samples);
    }
    Ok(usage)
}

fn merge_samples(usage: &mut UsageByContainer, signal: Signal, samples: Vec<Sample>) {
    for Sample { container, value } in samples {
        let slot = usage.entry(container).or_default().slot(signal);
        // a backend ignoring the `by (container)` grouping may repeat a container
        *slot = Some(slot.map_or(value, |known| known.max(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::FnBackend;
    use pretty_assertions::assert_eq;

    fn group(pods: &[&str]) -> ReplicaGroup {
        ReplicaGroup {
            namespace: "shop".to_string(),
            replica_set: "api-5d8f7".to_string(),
            pods: pods.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn sample(container: &str, value: f64) -> Sample {
        Sample {
            container: container.to_string(),
            value,
        }
    }

    #[test]
    fn test_window_from_str() -> anyhow::Result<()> {
        for valid in ["1w", "1d12h", "90m", "500ms", "1y2w3d4h5m6s7ms"] {
            assert_eq!(Window::from_str(valid)?.as_str(), valid);
        }
        assert_eq!(Window::from_str(" 2w ")?.as_str(), "2w");
        for invalid in [
            "", "w", "7", "7 days", "0d", "3x", "1.5h", "30s1m", "1m1m", "1h1d", "1s5ms1ms",
        ] {
            assert!(Window::from_str(invalid).is_err(), "{} should fail", invalid);
        }
        Ok(())
    }

    #[test]
    fn test_pod_selector_escapes_names() {
        assert_eq!(
            pod_selector(&group(&["api-5d8f7-abcde", "api-5d8f7-fghij"])),
            r#"namespace="shop", pod=~"api-5d8f7-abcde|api-5d8f7-fghij", container!="", container!="POD""#
        );
        assert_eq!(
            pod_selector(&group(&["web.v2-1"])),
            r#"namespace="shop", pod=~"web\\.v2-1", container!="", container!="POD""#
        );
    }

    #[test]
    fn test_build_query() {
        let settings = AggregationSettings::default();
        assert_eq!(
            build_query(Signal::RequestCpu, "pod=~\"a\"", &settings),
            "avg by (container) (quantile_over_time(0.9, node_namespace_pod_container:container_cpu_usage_seconds_total:sum_irate{pod=~\"a\"}[1w]))"
        );
        assert_eq!(
            build_query(Signal::LimitMemory, "pod=~\"a\"", &settings),
            "max by (container) (max_over_time(container_memory_working_set_bytes{pod=~\"a\"}[1w])) * 1.2"
        );
    }

    #[tokio::test]
    async fn test_aggregate_issues_four_queries_per_group() -> anyhow::Result<()> {
        let backend = FnBackend::new(|query: &str| {
            let is_memory = query.contains(MEMORY_METRIC);
            let is_limit = query.starts_with("max");
            Ok(match (is_memory, is_limit) {
                (false, false) => vec![sample("web", 0.27), sample("sidecar", 0.01)],
                (false, true) => vec![sample("web", 0.6)],
                (true, false) => vec![sample("web", 250.0 * 1024.0 * 1024.0)],
                (true, true) => vec![sample("web", 400.0 * 1024.0 * 1024.0)],
            })
        });
        let usage = aggregate(
            &backend,
            &group(&["api-1", "api-2", "api-3"]),
            &AggregationSettings::default(),
            Utc::now(),
        )
        .await?;
        assert_eq!(backend.queries().len(), 4);
        assert_eq!(
            usage.get("web"),
            Some(&ContainerUsage {
                request_cpu: Some(0.27),
                limit_cpu: Some(0.6),
                request_memory: Some(250.0 * 1024.0 * 1024.0),
                limit_memory: Some(400.0 * 1024.0 * 1024.0),
            })
        );
        // only seen by one signal, the others stay undetermined
        assert_eq!(
            usage.get("sidecar"),
            Some(&ContainerUsage {
                request_cpu: Some(0.01),
                ..ContainerUsage::default()
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_aggregate_without_pods_is_undetermined() -> anyhow::Result<()> {
        let backend = FnBackend::new(|_: &str| Ok(vec![sample("web", 1.0)]));
        let usage = aggregate(
            &backend,
            &group(&[]),
            &AggregationSettings::default(),
            Utc::now(),
        )
        .await?;
        assert!(usage.is_empty());
        assert!(backend.queries().is_empty());
        Ok(())
    }

    #[test]
    fn test_merge_samples_keeps_largest_duplicate() {
        let mut usage = UsageByContainer::new();
        merge_samples(
            &mut usage,
            Signal::LimitCpu,
            vec![sample("web", 0.4), sample("web", 0.7), sample("web", 0.5)],
        );
        assert_eq!(usage["web"].get(Signal::LimitCpu), Some(0.7));
        assert_eq!(usage["web"].get(Signal::RequestCpu), None);
    }
}
