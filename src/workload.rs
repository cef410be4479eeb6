use crate::Error;
use crate::qty::Qty;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// Annotation set by the deployment controller on a deployment and on the
/// replica set of each of its revisions.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Resources declared by a container of the pod template, in cores and bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub request_cpu: Option<f64>,
    pub request_memory: Option<f64>,
    pub limit_cpu: Option<f64>,
    pub limit_memory: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub revision: String,
    pub replicas: i32,
    pub containers: Vec<ContainerSpec>,
}

/// Pods of the replica set of the current revision of a workload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaGroup {
    pub namespace: String,
    pub replica_set: String,
    pub pods: Vec<String>,
}

/// Render a label selector in the syntax of `ListParams::labels`.
///
/// An empty selector is refused, it would match every object of the namespace.
pub fn selector_to_string(
    namespace: &str,
    name: &str,
    selector: &LabelSelector,
) -> Result<String, Error> {
    let invalid = |reason: String| Error::InvalidSelector {
        namespace: namespace.to_string(),
        name: name.to_string(),
        reason,
    };
    let mut terms = vec![];
    if let Some(labels) = &selector.match_labels {
        terms.extend(labels.iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    for requirement in selector.match_expressions.iter().flatten() {
        let key = &requirement.key;
        let values = requirement.values.clone().unwrap_or_default();
        let term = match requirement.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(invalid(format!(
                    "operator {} on {} requires values",
                    requirement.operator, key
                )));
            }
            "In" => format!("{} in ({})", key, values.join(",")),
            "NotIn" => format!("{} notin ({})", key, values.join(",")),
            "Exists" => key.to_string(),
            "DoesNotExist" => format!("!{}", key),
            other => return Err(invalid(format!("unknown operator {} on {}", other, key))),
        };
        terms.push(term);
    }
    if terms.is_empty() {
        return Err(invalid("empty selector".to_string()));
    }
    Ok(terms.join(","))
}

fn parse_resource(
    workload: &Workload,
    container: &Container,
    kind: &str,
    resources: Option<&BTreeMap<String, Quantity>>,
    resource_name: &str,
) -> Result<Option<f64>, Error> {
    let Some(value) = resources.and_then(|r| r.get(resource_name)) else {
        return Ok(None);
    };
    let qty = Qty::from_str(&value.0).map_err(|source| Error::ResourceQtyParseError {
        namespace: workload.namespace.clone(),
        workload: workload.name.clone(),
        container: container.name.clone(),
        kind: kind.to_string(),
        input: value.0.clone(),
        source,
    })?;
    Ok(Some(f64::from(&qty)))
}

fn extract_container_spec(
    workload: &Workload,
    container: &Container,
) -> Result<ContainerSpec, Error> {
    let requirements = container.resources.as_ref();
    let requests = requirements.and_then(|r| r.requests.as_ref());
    let limits = requirements.and_then(|r| r.limits.as_ref());
    let parse = |kind: &str, resources, resource_name: &str| {
        parse_resource(workload, container, kind, resources, resource_name)
    };
    Ok(ContainerSpec {
        name: container.name.clone(),
        request_cpu: parse("requests.cpu", requests, "cpu")?,
        request_memory: parse("requests.memory", requests, "memory")?,
        limit_cpu: parse("limits.cpu", limits, "cpu")?,
        limit_memory: parse("limits.memory", limits, "memory")?,
    })
}

/// Snapshot of a deployment: revision, replica count and the resources of the
/// containers of its pod template (init containers are not measured).
pub fn extract_workload(namespace: &str, deployment: &Deployment) -> Result<Workload, Error> {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let revision = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .cloned()
        .ok_or_else(|| Error::MissingRevision {
            namespace: namespace.to_string(),
            deployment: name.clone(),
        })?;
    let spec = deployment.spec.as_ref();
    let mut workload = Workload {
        namespace: namespace.to_string(),
        name,
        revision,
        // the api-server defaults an unset replicas to 1
        replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
        containers: vec![],
    };
    let containers = spec
        .and_then(|s| s.template.spec.as_ref())
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    for container in containers {
        let container_spec = extract_container_spec(&workload, container)?;
        workload.containers.push(container_spec);
    }
    Ok(workload)
}

/// Replica sets controlled by another deployment can share labels with this
/// one when selectors overlap, they never belong to this workload.
fn is_owned_by_other(replica_set: &ReplicaSet, deployment: &str) -> bool {
    replica_set
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.controller == Some(true) && o.kind == "Deployment" && o.name != deployment)
}

/// The replica set of the current revision: exactly one must match.
pub fn find_active_replica_set<'a>(
    workload: &Workload,
    replica_sets: &'a [ReplicaSet],
) -> Result<&'a ReplicaSet, Error> {
    let matches = replica_sets
        .iter()
        .filter(|rs| !is_owned_by_other(rs, &workload.name))
        .filter(|rs| {
            rs.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                == Some(&workload.revision)
        })
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [active] => Ok(*active),
        _ => Err(Error::AmbiguousTopology {
            namespace: workload.namespace.clone(),
            deployment: workload.name.clone(),
            revision: workload.revision.clone(),
            matches: matches.len(),
        }),
    }
}

pub fn extract_replica_group(namespace: &str, replica_set: &str, pods: Vec<Pod>) -> ReplicaGroup {
    ReplicaGroup {
        namespace: namespace.to_string(),
        replica_set: replica_set.to_string(),
        pods: pods
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect(),
    }
}

#[instrument(skip(client, deployment))]
async fn resolve_deployment(
    client: kube::Client,
    namespace: &str,
    deployment: &Deployment,
) -> Result<(Workload, ReplicaGroup), Error> {
    let workload = extract_workload(namespace, deployment)?;
    let selector = match deployment.spec.as_ref() {
        Some(spec) => selector_to_string(namespace, &workload.name, &spec.selector)?,
        None => selector_to_string(namespace, &workload.name, &LabelSelector::default())?,
    };
    let api_replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), namespace);
    let replica_sets = api_replica_sets
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|source| Error::KubeError {
            context: format!("list replicasets of {}/{}", namespace, workload.name),
            source,
        })?;
    let replica_set = find_active_replica_set(&workload, &replica_sets.items)?;
    let replica_set_name = replica_set.metadata.name.clone().unwrap_or_default();
    let pod_selector = match replica_set.spec.as_ref() {
        Some(spec) => selector_to_string(namespace, &replica_set_name, &spec.selector)?,
        None => selector_to_string(namespace, &replica_set_name, &LabelSelector::default())?,
    };
    debug!(replica_set = replica_set_name.as_str(), pod_selector = pod_selector.as_str());
    let api_pods: Api<Pod> = Api::namespaced(client, namespace);
    let pods = api_pods
        .list(&ListParams::default().labels(&pod_selector))
        .await
        .map_err(|source| Error::KubeError {
            context: format!("list pods of {}/{}", namespace, replica_set_name),
            source,
        })?;
    let group = extract_replica_group(namespace, &replica_set_name, pods.items);
    info!(
        deployment = workload.name.as_str(),
        revision = workload.revision.as_str(),
        replica_set = group.replica_set.as_str(),
        pods = group.pods.len()
    );
    Ok((workload, group))
}

/// Deployments of every namespace (input order, then listing order) with the
/// pods of their current revision.
#[instrument(skip(client))]
pub async fn resolve_workloads(
    client: kube::Client,
    namespaces: &[String],
) -> Result<Vec<(Workload, ReplicaGroup)>, Error> {
    let mut resolved = vec![];
    for namespace in namespaces {
        let api_deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let deployments = api_deployments
            .list(&ListParams::default())
            .await
            .map_err(|source| Error::KubeError {
                context: format!("list deployments of namespace {}", namespace),
                source,
            })?;
        for deployment in deployments.items.iter() {
            resolved.push(resolve_deployment(client.clone(), namespace, deployment).await?);
        }
    }
    Ok(resolved)
}
