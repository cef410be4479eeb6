pub mod aggregate;
pub mod display;
pub mod metrics;
pub mod qty;
pub mod recommend;
pub mod report;
pub mod workload;

use aggregate::{AggregationSettings, Window, aggregate};
use chrono::prelude::*;
use clap::{Parser, ValueEnum};
use metrics::{MetricsBackend, PrometheusProxy};
use recommend::recommend;
use report::Report;
use std::str::FromStr;
use tracing::{info, instrument};
use workload::{ReplicaGroup, Workload};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to read Qty of {namespace}/{workload} container {container:?} {kind}={input}")]
    ResourceQtyParseError {
        namespace: String,
        workload: String,
        container: String,
        kind: String,
        input: String,
        source: qty::Error,
    },

    #[error("Deployment {namespace}/{deployment} has no revision annotation")]
    MissingRevision {
        namespace: String,
        deployment: String,
    },

    #[error(
        "Deployment {namespace}/{deployment} has {matches} replica sets with revision {revision}, expected exactly one"
    )]
    AmbiguousTopology {
        namespace: String,
        deployment: String,
        revision: String,
        matches: usize,
    },

    #[error("Invalid label selector of {namespace}/{name}: {reason}")]
    InvalidSelector {
        namespace: String,
        name: String,
        reason: String,
    },

    /// Transport failure, or any non 2xx answer: prometheus replies to invalid
    /// or timed out queries with a 4xx/5xx status that the kube client turns into
    /// `kube::Error::Api`, its body text ending up in the source message.
    #[error("Failed to query prometheus with '{query}'")]
    QueryError { query: String, source: kube::Error },

    /// `status: error` delivered with a 2xx status, as some proxies in front of
    /// prometheus do.
    #[error("Prometheus rejected '{query}': {error_type}: {error}")]
    QueryRejected {
        query: String,
        error_type: String,
        error: String,
    },

    #[error("Prometheus answered '{query}' with a {result_type} instead of a vector")]
    UnexpectedResultType { query: String, result_type: String },

    #[error("Prometheus answered '{query}' with an unreadable sample {input:?}")]
    MalformedSample { query: String, input: String },

    #[error("Invalid value for --{name}: {reason}")]
    InvalidOption { name: String, reason: String },

    #[error("Failed to build the prometheus request")]
    RequestBuildError {
        #[from]
        source: http::Error,
    },

    #[error("Failed to serialize the report")]
    SerializeError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Failed to {context}")]
    KubeError {
        context: String,
        source: kube::Error,
    },

    #[error("Failed to {context}")]
    KubeConfigError {
        context: String,
        source: kube::config::KubeconfigError,
    },

    #[error("Failed to {context}")]
    KubeInferConfigError {
        context: String,
        source: kube::config::InferConfigError,
    },
}

#[derive(Debug, Eq, PartialEq, ValueEnum, Clone)]
#[allow(non_camel_case_types)]
pub enum Output {
    table,
    csv,
    json,
}

#[derive(Parser, Debug)]
#[command(version, about, propagate_version = true)]
pub struct CliOpts {
    /// The name of the kubeconfig context to use
    #[arg(long, value_parser)]
    pub context: Option<String>,

    /// Namespaces to analyze, comma separated or repeated (default: the namespace of the kubeconfig context)
    #[arg(short, long, value_delimiter = ',', value_parser)]
    pub namespace: Vec<String>,

    /// Trailing window of history to analyze, in prometheus duration syntax (eg: 1w, 3d, 1d12h)
    #[arg(short, long, default_value = "1w", value_parser)]
    pub window: String,

    /// Quantile of the cpu & memory usage used as request
    #[arg(short, long, default_value_t = 0.9, value_parser)]
    pub quantile: f64,

    /// Factor applied to the peak usage to size limits
    #[arg(short = 'm', long, default_value_t = 1.2, value_parser)]
    pub limit_margin: f64,

    /// Namespace of the prometheus service, reached through the api-server proxy
    #[arg(long, default_value = "monitoring", value_parser)]
    pub prometheus_namespace: String,

    /// Name (and port) of the prometheus service, reached through the api-server proxy
    #[arg(long, default_value = "prometheus-operated:web", value_parser)]
    pub prometheus_service: String,

    /// Series of the per container cpu usage rate
    #[arg(long, default_value = aggregate::DEFAULT_CPU_METRIC, value_parser)]
    pub cpu_metric: String,

    /// Output format
    #[arg(
        short,
        long,
        value_enum,
        ignore_case = true,
        default_value = "table",
        value_parser
    )]
    pub output: Output,
}

impl TryFrom<&CliOpts> for AggregationSettings {
    type Error = Error;

    fn try_from(cli_opts: &CliOpts) -> Result<Self, Self::Error> {
        let window = Window::from_str(&cli_opts.window)?;
        if !(0.0..=1.0).contains(&cli_opts.quantile) {
            return Err(Error::InvalidOption {
                name: "quantile".to_string(),
                reason: format!("{} is not within [0, 1]", cli_opts.quantile),
            });
        }
        if !cli_opts.limit_margin.is_finite() || cli_opts.limit_margin < 1.0 {
            return Err(Error::InvalidOption {
                name: "limit-margin".to_string(),
                reason: format!("{} is lower than 1", cli_opts.limit_margin),
            });
        }
        if cli_opts.cpu_metric.trim().is_empty() {
            return Err(Error::InvalidOption {
                name: "cpu-metric".to_string(),
                reason: "empty series name".to_string(),
            });
        }
        Ok(AggregationSettings {
            window,
            quantile: cli_opts.quantile,
            limit_margin: cli_opts.limit_margin,
            cpu_metric: cli_opts.cpu_metric.trim().to_string(),
        })
    }
}

pub async fn new_client(cli_opts: &CliOpts) -> Result<kube::Client, Error> {
    let client_config = match cli_opts.context {
        Some(ref context) => kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        })
        .await
        .map_err(|source| Error::KubeConfigError {
            context: "create the kube client config".to_string(),
            source,
        })?,
        None => kube::Config::infer()
            .await
            .map_err(|source| Error::KubeInferConfigError {
                context: "create the kube client config".to_string(),
                source,
            })?,
    };
    info!(cluster_url = client_config.cluster_url.to_string().as_str());
    kube::Client::try_from(client_config).map_err(|source| Error::KubeError {
        context: "create the kube client".to_string(),
        source,
    })
}

/// Namespaces requested on the command line, without blanks nor duplicates,
/// falling back to the namespace of the kubeconfig context.
pub fn select_namespaces(requested: &[String], default_namespace: &str) -> Vec<String> {
    let mut namespaces: Vec<String> = vec![];
    for ns in requested.iter().map(|ns| ns.trim()).filter(|ns| !ns.is_empty()) {
        if !namespaces.iter().any(|known| known == ns) {
            namespaces.push(ns.to_string());
        }
    }
    if namespaces.is_empty() {
        namespaces.push(default_namespace.to_string());
    }
    namespaces
}

/// Measure and recommend every resolved workload, in resolution order.
///
/// The first failing query aborts the whole pass, no partial report is returned.
#[instrument(skip(backend, workloads, settings))]
pub async fn build_report<B: MetricsBackend>(
    backend: &B,
    workloads: Vec<(Workload, ReplicaGroup)>,
    settings: &AggregationSettings,
    at: DateTime<Utc>,
) -> Result<Report, Error> {
    let mut report = Report::default();
    for (workload, group) in workloads {
        let usage = aggregate(backend, &group, settings, at).await?;
        report.push(recommend(&workload, &usage));
    }
    info!(
        rows = report.rows().len(),
        undetermined = report.undetermined(),
        "report built"
    );
    Ok(report)
}

#[instrument(skip(client, backend, settings))]
pub async fn run_pass<B: MetricsBackend>(
    client: kube::Client,
    backend: &B,
    namespaces: &[String],
    settings: &AggregationSettings,
    at: DateTime<Utc>,
) -> Result<Report, Error> {
    let workloads = workload::resolve_workloads(client, namespaces).await?;
    info!(workloads = workloads.len(), "resolved");
    build_report(backend, workloads, settings, at).await
}

#[instrument]
pub async fn do_main(cli_opts: &CliOpts) -> Result<(), Error> {
    let settings = AggregationSettings::try_from(cli_opts)?;
    let client = new_client(cli_opts).await?;
    let namespaces = select_namespaces(&cli_opts.namespace, client.default_namespace());
    let backend = PrometheusProxy::new(
        client.clone(),
        &cli_opts.prometheus_namespace,
        &cli_opts.prometheus_service,
    );
    let report = run_pass(client, &backend, &namespaces, &settings, Utc::now()).await?;
    match &cli_opts.output {
        Output::table => display::display_with_prettytable(&report),
        Output::csv => display::display_as_csv(&report),
        Output::json => display::display_as_json(&report)?,
    }
    Ok(())
}
