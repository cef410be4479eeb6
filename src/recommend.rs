//! Turn measured usage into rounded recommendations and savings.
//!
//! Deltas are savings: `current - recommended`. A positive delta frees capacity,
//! a negative one asks for more, and a resource not defined yet counts for its
//! whole recommendation. Only requests reserve scheduler capacity, so only
//! request deltas (times the replica count) feed the totals.

use crate::aggregate::{ContainerUsage, Signal, UsageByContainer};
use crate::workload::{ContainerSpec, Workload};
use serde::Serialize;
use tracing::warn;

pub const CPU_BUCKETS_PER_CORE: f64 = 10.0;
pub const MEMORY_BUCKET_BYTES: f64 = 100.0 * 1024.0 * 1024.0;

/// Upper bound of the recommendation advising a decrease, as a ratio of the current value.
pub const DECREASE_BELOW: f64 = 0.8;
/// Lower bound of the recommendation advising an increase, as a ratio of the current value.
pub const INCREASE_ABOVE: f64 = 1.1;

/// A current or recommended amount, in cores or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum Amount {
    Value(f64),
    /// not declared on the container, never read as zero
    Absent,
    /// no sample in the metrics backend
    Undetermined,
}

impl Amount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Amount::Value(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Advice {
    Define,
    Increase,
    Decrease,
    Keep,
    Unknown,
}

impl std::fmt::Display for Advice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Define => "define",
            Self::Increase => "increase",
            Self::Decrease => "decrease",
            Self::Keep => "keep",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub current: Amount,
    pub recommended: Amount,
    pub advice: Advice,
}

impl Estimate {
    pub fn new(current: Amount, recommended: Amount) -> Self {
        let advice = match (current.value(), recommended.value()) {
            (_, None) => Advice::Unknown,
            (None, Some(_)) => Advice::Define,
            (Some(current), Some(recommended)) => {
                if recommended > current * INCREASE_ABOVE {
                    Advice::Increase
                } else if recommended < current * DECREASE_BELOW {
                    Advice::Decrease
                } else {
                    Advice::Keep
                }
            }
        };
        Estimate {
            current,
            recommended,
            advice,
        }
    }

    /// `None` when the recommendation is undetermined.
    pub fn delta(&self) -> Option<f64> {
        self.recommended
            .value()
            .map(|recommended| self.current.value().unwrap_or(0.0) - recommended)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationRow {
    pub namespace: String,
    pub workload: String,
    pub container: String,
    pub request_cpu: Estimate,
    pub limit_cpu: Estimate,
    pub request_memory: Estimate,
    pub limit_memory: Estimate,
    /// per replica
    pub cpu_delta: Option<f64>,
    /// per replica
    pub memory_delta: Option<f64>,
}

impl RecommendationRow {
    pub fn estimate(&self, signal: Signal) -> &Estimate {
        match signal {
            Signal::RequestCpu => &self.request_cpu,
            Signal::LimitCpu => &self.limit_cpu,
            Signal::RequestMemory => &self.request_memory,
            Signal::LimitMemory => &self.limit_memory,
        }
    }
}

/// Rows of a workload and its contribution (deltas times replicas) to the totals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkloadRecommendation {
    pub rows: Vec<RecommendationRow>,
    pub cpu_delta: f64,
    pub memory_delta: f64,
}

/// Smallest multiple of a bucket that is >= value.
///
/// `to_buckets` and `from_buckets` are exact inverses for whole buckets, so a
/// value already on a boundary is returned unchanged.
fn round_up(value: f64, to_buckets: fn(f64) -> f64, from_buckets: fn(f64) -> f64) -> f64 {
    if value <= 0.0 {
        return 0.0;
    }
    let mut n = to_buckets(value).ceil();
    if from_buckets(n) < value {
        n += 1.0;
    }
    if n > 1.0 && from_buckets(n - 1.0) >= value {
        n -= 1.0;
    }
    from_buckets(n)
}

/// Round cores up to the next tenth of a core.
pub fn round_cpu(cores: f64) -> f64 {
    round_up(
        cores,
        |v| v * CPU_BUCKETS_PER_CORE,
        |n| n / CPU_BUCKETS_PER_CORE,
    )
}

/// Round bytes up to the next 100Mi.
pub fn round_memory(bytes: f64) -> f64 {
    round_up(
        bytes,
        |v| v / MEMORY_BUCKET_BYTES,
        |n| n * MEMORY_BUCKET_BYTES,
    )
}

fn current(value: Option<f64>) -> Amount {
    value.map(Amount::Value).unwrap_or(Amount::Absent)
}

fn recommended(usage: Option<&ContainerUsage>, signal: Signal) -> Amount {
    let rounding = if signal.is_cpu() { round_cpu } else { round_memory };
    usage
        .and_then(|u| u.get(signal))
        .map(|v| Amount::Value(rounding(v)))
        .unwrap_or(Amount::Undetermined)
}

fn recommend_container(
    workload: &Workload,
    spec: &ContainerSpec,
    usage: Option<&ContainerUsage>,
) -> RecommendationRow {
    let request_cpu = Estimate::new(
        current(spec.request_cpu),
        recommended(usage, Signal::RequestCpu),
    );
    let request_memory = Estimate::new(
        current(spec.request_memory),
        recommended(usage, Signal::RequestMemory),
    );
    RecommendationRow {
        namespace: workload.namespace.clone(),
        workload: workload.name.clone(),
        container: spec.name.clone(),
        cpu_delta: request_cpu.delta(),
        memory_delta: request_memory.delta(),
        request_cpu,
        limit_cpu: Estimate::new(
            current(spec.limit_cpu),
            recommended(usage, Signal::LimitCpu),
        ),
        request_memory,
        limit_memory: Estimate::new(
            current(spec.limit_memory),
            recommended(usage, Signal::LimitMemory),
        ),
    }
}

/// One row per container of the pod template, in template order.
pub fn recommend(workload: &Workload, usage: &UsageByContainer) -> WorkloadRecommendation {
    let replicas = f64::from(workload.replicas.max(0));
    let mut out = WorkloadRecommendation::default();
    for spec in workload.containers.iter() {
        let row = recommend_container(workload, spec, usage.get(&spec.name));
        for signal in Signal::ALL {
            if row.estimate(signal).recommended == Amount::Undetermined {
                warn!(
                    namespace = workload.namespace.as_str(),
                    deployment = workload.name.as_str(),
                    container = spec.name.as_str(),
                    %signal,
                    "could not determine"
                );
            }
        }
        out.cpu_delta += row.cpu_delta.unwrap_or(0.0) * replicas;
        out.memory_delta += row.memory_delta.unwrap_or(0.0) * replicas;
        out.rows.push(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MI: f64 = 1024.0 * 1024.0;

    fn workload(replicas: i32, containers: Vec<ContainerSpec>) -> Workload {
        Workload {
            namespace: "shop".to_string(),
            name: "api".to_string(),
            revision: "3".to_string(),
            replicas,
            containers,
        }
    }

    fn container(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn test_round_cpu() {
        assert_eq!(round_cpu(0.27), 0.3);
        assert_eq!(round_cpu(0.3), 0.3);
        assert_eq!(round_cpu(0.30001), 0.4);
        assert_eq!(round_cpu(0.01), 0.1);
        assert_eq!(round_cpu(1.0), 1.0);
        assert_eq!(round_cpu(0.0), 0.0);
    }

    #[test]
    fn test_round_memory() {
        assert_eq!(round_memory(250.0 * MI), 300.0 * MI);
        assert_eq!(round_memory(300.0 * MI), 300.0 * MI);
        assert_eq!(round_memory(300.0 * MI + 1.0), 400.0 * MI);
        assert_eq!(round_memory(1.0), 100.0 * MI);
    }

    #[test]
    fn test_rounding_is_monotonic_and_idempotent() {
        let mut cores = 0.0;
        while cores < 8.0 {
            let rounded = round_cpu(cores);
            assert!(rounded >= cores, "round_cpu({}) = {}", cores, rounded);
            assert!(rounded - cores < 0.1 + 1e-9, "round_cpu({}) = {}", cores, rounded);
            assert_eq!(round_cpu(rounded), rounded);
            cores += 0.013;
        }
        let mut bytes = 0.0;
        while bytes < 4096.0 * MI {
            let rounded = round_memory(bytes);
            assert!(rounded >= bytes);
            assert!(rounded - bytes < 100.0 * MI);
            assert_eq!(round_memory(rounded), rounded);
            bytes += 37.5 * MI + 123.0;
        }
        for tenth in 1..=100 {
            let boundary = f64::from(tenth) / 10.0;
            assert_eq!(round_cpu(boundary), boundary);
        }
    }

    #[test]
    fn test_advice() {
        let advice = |current, recommended| Estimate::new(current, recommended).advice;
        assert_eq!(advice(Amount::Absent, Amount::Value(0.3)), Advice::Define);
        assert_eq!(advice(Amount::Value(1.0), Amount::Value(0.5)), Advice::Decrease);
        assert_eq!(advice(Amount::Value(1.0), Amount::Value(1.2)), Advice::Increase);
        assert_eq!(advice(Amount::Value(1.0), Amount::Value(0.9)), Advice::Keep);
        assert_eq!(advice(Amount::Value(1.0), Amount::Undetermined), Advice::Unknown);
        assert_eq!(advice(Amount::Absent, Amount::Undetermined), Advice::Unknown);
    }

    #[test]
    fn test_new_request_counts_for_every_replica() {
        let usage = UsageByContainer::from([(
            "web".to_string(),
            ContainerUsage {
                request_cpu: Some(0.27),
                ..ContainerUsage::default()
            },
        )]);
        let out = recommend(&workload(3, vec![container("web")]), &usage);
        let row = &out.rows[0];
        assert_eq!(row.request_cpu.current, Amount::Absent);
        assert_eq!(row.request_cpu.recommended, Amount::Value(0.3));
        assert_eq!(row.request_cpu.advice, Advice::Define);
        assert_eq!(row.cpu_delta, Some(-0.3));
        assert!((out.cpu_delta + 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_same_bucket_is_no_saving() {
        let mut web = container("web");
        web.request_memory = Some(300.0 * MI);
        web.request_cpu = Some(0.3);
        let usage = UsageByContainer::from([(
            "web".to_string(),
            ContainerUsage {
                request_cpu: Some(0.25),
                request_memory: Some(250.0 * MI),
                ..ContainerUsage::default()
            },
        )]);
        let out = recommend(&workload(4, vec![web]), &usage);
        assert_eq!(out.rows[0].request_memory.recommended, Amount::Value(300.0 * MI));
        assert_eq!(out.rows[0].memory_delta, Some(0.0));
        assert_eq!(out.rows[0].cpu_delta, Some(0.0));
        assert_eq!(out.cpu_delta, 0.0);
        assert_eq!(out.memory_delta, 0.0);
    }

    #[test]
    fn test_missing_sample_is_undetermined() {
        let mut sidecar = container("sidecar");
        sidecar.request_cpu = Some(0.5);
        let usage = UsageByContainer::from([(
            "web".to_string(),
            ContainerUsage {
                request_cpu: Some(0.27),
                ..ContainerUsage::default()
            },
        )]);
        let out = recommend(&workload(2, vec![sidecar]), &usage);
        let row = &out.rows[0];
        for signal in Signal::ALL {
            assert_eq!(row.estimate(signal).recommended, Amount::Undetermined);
        }
        assert_eq!(row.request_cpu.current, Amount::Value(0.5));
        assert_eq!(row.cpu_delta, None);
        assert_eq!(row.memory_delta, None);
        assert_eq!(out.cpu_delta, 0.0);
        assert_eq!(out.memory_delta, 0.0);
    }

    #[test]
    fn test_limits_do_not_count_in_totals() {
        let mut web = container("web");
        web.request_cpu = Some(0.5);
        web.limit_cpu = Some(4.0);
        let usage = UsageByContainer::from([(
            "web".to_string(),
            ContainerUsage {
                request_cpu: Some(0.5),
                limit_cpu: Some(0.72),
                ..ContainerUsage::default()
            },
        )]);
        let out = recommend(&workload(2, vec![web]), &usage);
        assert_eq!(out.rows[0].limit_cpu.recommended, Amount::Value(0.8));
        assert_eq!(out.rows[0].limit_cpu.advice, Advice::Decrease);
        assert_eq!(out.cpu_delta, 0.0);
    }

    #[test]
    fn test_workload_total_is_sum_of_rows_times_replicas() {
        let mut web = container("web");
        web.request_cpu = Some(1.0);
        web.request_memory = Some(1024.0 * MI);
        let mut worker = container("worker");
        worker.request_cpu = Some(0.1);
        let usage = UsageByContainer::from([
            (
                "web".to_string(),
                ContainerUsage {
                    request_cpu: Some(0.42),
                    request_memory: Some(612.0 * MI),
                    ..ContainerUsage::default()
                },
            ),
            (
                "worker".to_string(),
                ContainerUsage {
                    request_cpu: Some(0.35),
                    request_memory: Some(80.0 * MI),
                    ..ContainerUsage::default()
                },
            ),
        ]);
        let out = recommend(&workload(5, vec![web, worker]), &usage);
        let cpu: f64 = out.rows.iter().filter_map(|r| r.cpu_delta).sum::<f64>() * 5.0;
        let memory: f64 = out.rows.iter().filter_map(|r| r.memory_delta).sum::<f64>() * 5.0;
        assert!((out.cpu_delta - cpu).abs() < 1e-9);
        assert!((out.memory_delta - memory).abs() < 1e-3);
        // web: 1.0 - 0.5, worker: 0.1 - 0.4
        assert!((out.cpu_delta - 1.0).abs() < 1e-9);
        // web: 1024Mi - 700Mi, worker: 0 - 100Mi
        assert!((out.memory_delta - 5.0 * 224.0 * MI).abs() < 1e-3);
    }
}
