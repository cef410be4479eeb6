use crate::Error;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, instrument, warn};
// kubectl get --raw '/api/v1/namespaces/monitoring/services/prometheus-operated:web/proxy/api/v1/query?query=up' | jq .

/// The label used as grouping key, every other label is dropped at ingestion.
pub const CONTAINER_LABEL: &str = "container";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    pub result_type: String,
    // shape depends on result_type, only "vector" is decoded further
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct VectorSample {
    pub metric: BTreeMap<String, String>,
    pub value: (f64, String),
}

/// One point of an instant vector, reduced to its container.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub container: String,
    pub value: f64,
}

/// A time-series backend able to evaluate an instant query.
pub trait MetricsBackend {
    fn query(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Sample>, Error>>;
}

/// Prometheus reached through the api-server service proxy, so it shares the
/// authentication and tls setup of the kube client.
#[derive(Clone)]
pub struct PrometheusProxy {
    client: kube::Client,
    base_path: String,
}

impl PrometheusProxy {
    pub fn new(client: kube::Client, namespace: &str, service: &str) -> Self {
        Self {
            client,
            base_path: proxy_base_path(namespace, service),
        }
    }

    fn query_uri(&self, query: &str, at: DateTime<Utc>) -> String {
        query_uri(&self.base_path, query, at)
    }
}

fn proxy_base_path(namespace: &str, service: &str) -> String {
    format!(
        "/api/v1/namespaces/{}/services/{}/proxy",
        namespace.trim(),
        service.trim()
    )
}

fn query_uri(base_path: &str, query: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/api/v1/query?query={}&time={}",
        base_path.trim_end_matches('/'),
        urlencoding::encode(query),
        at.timestamp()
    )
}

impl MetricsBackend for PrometheusProxy {
    #[instrument(skip(self))]
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>, Error> {
        let request = http::Request::get(self.query_uri(query, at)).body(Vec::new())?;
        let response: QueryResponse =
            self.client
                .request(request)
                .await
                .map_err(|source| Error::QueryError {
                    query: query.to_string(),
                    source,
                })?;
        extract_samples(query, response)
    }
}

/// Keep the container label and the value of each sample of a vector result.
///
/// Samples without container label are dropped, and so are non finite values
/// (`NaN`, `+Inf`) since they carry no usable estimate.
///
/// Only responses received with a 2xx status reach this point, so `status: error`
/// is rare here: rejected queries usually surface as [`Error::QueryError`].
pub fn extract_samples(query: &str, response: QueryResponse) -> Result<Vec<Sample>, Error> {
    for warning in response.warnings.iter() {
        warn!(query, %warning, "prometheus warning");
    }
    if response.status != "success" {
        return Err(Error::QueryRejected {
            query: query.to_string(),
            error_type: response.error_type.unwrap_or_else(|| "unknown".to_string()),
            error: response.error.unwrap_or_default(),
        });
    }
    let Some(data) = response.data else {
        return Ok(vec![]);
    };
    if data.result_type != "vector" {
        return Err(Error::UnexpectedResultType {
            query: query.to_string(),
            result_type: data.result_type,
        });
    }
    let vector: Vec<VectorSample> =
        serde_json::from_value(data.result).map_err(|err| Error::MalformedSample {
            query: query.to_string(),
            input: err.to_string(),
        })?;
    let mut samples = vec![];
    for sample in vector {
        let Some(container) = sample.metric.get(CONTAINER_LABEL) else {
            debug!(query, metric = ?sample.metric, "drop sample without container");
            continue;
        };
        let raw = &sample.value.1;
        let value: f64 = raw.parse().map_err(|_| Error::MalformedSample {
            query: query.to_string(),
            input: raw.clone(),
        })?;
        if !value.is_finite() {
            debug!(query, %container, %raw, "drop non finite sample");
            continue;
        }
        samples.push(Sample {
            container: container.clone(),
            value,
        });
    }
    Ok(samples)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// In memory backend answering from a closure, and recording every query.
    pub(crate) struct FnBackend<F> {
        answer: F,
        queries: Mutex<Vec<String>>,
    }

    impl<F> FnBackend<F>
    where
        F: Fn(&str) -> Result<Vec<Sample>, Error>,
    {
        pub(crate) fn new(answer: F) -> Self {
            Self {
                answer,
                queries: Mutex::new(vec![]),
            }
        }

        pub(crate) fn queries(&self) -> Vec<String> {
            self.queries.lock().expect("queries lock").clone()
        }
    }

    impl<F> MetricsBackend for FnBackend<F>
    where
        F: Fn(&str) -> Result<Vec<Sample>, Error>,
    {
        async fn query(&self, query: &str, _at: DateTime<Utc>) -> Result<Vec<Sample>, Error> {
            self.queries
                .lock()
                .expect("queries lock")
                .push(query.to_string());
            (self.answer)(query)
        }
    }

    fn response(json: serde_json::Value) -> QueryResponse {
        serde_json::from_value(json).expect("valid prometheus response")
    }

    #[test]
    fn test_extract_samples_keeps_only_container_label() -> anyhow::Result<()> {
        let response = response(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"container": "web", "pod": "api-1"}, "value": [1700000000.0, "0.27"]},
                    {"metric": {"container": "sidecar"}, "value": [1700000000.0, "NaN"]},
                    {"metric": {"pod": "api-1"}, "value": [1700000000.0, "1"]},
                    {"metric": {"container": "proxy"}, "value": [1700000000.0, "+Inf"]}
                ]
            }
        }));
        let samples = extract_samples("q", response)?;
        assert_eq!(
            samples,
            vec![Sample {
                container: "web".to_string(),
                value: 0.27
            }]
        );
        Ok(())
    }

    #[test]
    fn test_extract_samples_errors() {
        let rejected = response(serde_json::json!({
            "status": "error",
            "errorType": "bad_data",
            "error": "parse error at char 3"
        }));
        assert!(matches!(
            extract_samples("q", rejected),
            Err(Error::QueryRejected { ref error_type, .. }) if error_type == "bad_data"
        ));

        let matrix = response(serde_json::json!({
            "status": "success",
            "data": {"resultType": "matrix", "result": []}
        }));
        assert!(matches!(
            extract_samples("q", matrix),
            Err(Error::UnexpectedResultType { .. })
        ));

        let garbage = response(serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": [
                {"metric": {"container": "web"}, "value": [1700000000.0, "twelve"]}
            ]}
        }));
        assert!(matches!(
            extract_samples("q", garbage),
            Err(Error::MalformedSample { ref input, .. }) if input == "twelve"
        ));
    }

    #[test]
    fn test_query_uri() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        let base = proxy_base_path("monitoring", "prometheus-operated:web");
        assert_eq!(
            query_uri(&base, "max by (container) (up{pod=~\"a|b\"})", at),
            "/api/v1/namespaces/monitoring/services/prometheus-operated:web/proxy/api/v1/query?query=max%20by%20%28container%29%20%28up%7Bpod%3D~%22a%7Cb%22%7D%29&time=1700000000"
        );
    }
}
