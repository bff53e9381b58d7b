//! Builders for the Deployment and Service managed per proxy resource

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, LocalObjectReference, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::{
    Exposure, PodTemplate, ResourceRequirementsSpec, TolerationSpec, VirtualPartitionProxy,
    VirtualPartitionProxySpec,
};
use crate::error::{Error, Result};
use crate::validation::pod_affinity;

/// Pod annotation holding [`config_hash`], so spec edits roll the pods
pub const CONFIG_HASH_ANNOTATION: &str = "partmux.io/config-hash";

const CONTAINER_NAME: &str = "proxy";
const KAFKA_PORT_NAME: &str = "kafka";
const METRICS_PORT_NAME: &str = "metrics";

/// Proxy environment, mirroring the variables `ProxyConfig::from_env` reads
mod env {
    pub const BIND_ADDR: &str = "PARTMUX_BIND_ADDR";
    pub const ADVERTISED_HOST: &str = "PARTMUX_ADVERTISED_HOST";
    pub const ADVERTISED_PORT: &str = "PARTMUX_ADVERTISED_PORT";
    pub const BOOTSTRAP_SERVERS: &str = "PARTMUX_BOOTSTRAP_SERVERS";
    pub const VIRTUAL_PARTITIONS: &str = "PARTMUX_VIRTUAL_PARTITIONS";
    pub const PHYSICAL_PARTITIONS: &str = "PARTMUX_PHYSICAL_PARTITIONS";
    pub const METRICS_ADDR: &str = "PARTMUX_METRICS_ADDR";
    pub const CONNECT_TIMEOUT_MS: &str = "PARTMUX_CONNECT_TIMEOUT_MS";
    pub const REQUEST_TIMEOUT_MS: &str = "PARTMUX_REQUEST_TIMEOUT_MS";
    pub const METADATA_REFRESH_MS: &str = "PARTMUX_METADATA_REFRESH_MS";
    pub const MAX_CONNECTIONS: &str = "PARTMUX_MAX_CONNECTIONS";
    pub const TOPIC_MAPPINGS: &str = "PARTMUX_TOPIC_MAPPINGS";
    pub const LOG_FILTER: &str = "RUST_LOG";
    pub const LOG_FORMAT: &str = "PARTMUX_LOG_FORMAT";
}

pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "partmux-proxy".to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "partmux-operator".to_string(),
        ),
    ])
}

/// First 16 hex characters of the SHA-256 of the spec's JSON form
pub fn config_hash(spec: &VirtualPartitionProxySpec) -> Result<String> {
    let json = serde_json::to_vec(spec)?;
    let digest = Sha256::digest(&json);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(hex[..16].to_string())
}

fn namespace(proxy: &VirtualPartitionProxy) -> Result<String> {
    proxy
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

fn owner_reference(proxy: &VirtualPartitionProxy) -> Result<OwnerReference> {
    proxy
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))
}

/// In-cluster DNS name of the proxy Service
pub fn service_host(proxy: &VirtualPartitionProxy) -> Result<String> {
    Ok(format!(
        "{}.{}.svc.cluster.local",
        proxy.name_any(),
        namespace(proxy)?
    ))
}

/// Prometheus scrape URL behind the proxy Service
pub fn metrics_endpoint(proxy: &VirtualPartitionProxy) -> Result<String> {
    Ok(format!(
        "http://{}:{}/metrics",
        service_host(proxy)?,
        proxy.spec.metrics_port
    ))
}

/// Host the proxy pods advertise in Metadata and FindCoordinator responses
pub fn advertised_host(proxy: &VirtualPartitionProxy) -> Result<String> {
    match &proxy.spec.advertised_host {
        Some(host) => Ok(host.clone()),
        None => service_host(proxy),
    }
}

fn env_var(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// `topic=virtual:physical` list with unset counts filled in from the resource
fn topic_mappings(spec: &VirtualPartitionProxySpec) -> String {
    spec.topic_overrides
        .iter()
        .map(|entry| {
            let (virtual_partitions, physical_partitions) = entry.counts(spec);
            format!(
                "{}={}:{}",
                entry.topic.trim(),
                virtual_partitions,
                physical_partitions
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn proxy_env(proxy: &VirtualPartitionProxy) -> Result<Vec<EnvVar>> {
    let spec = &proxy.spec;
    let mut vars = vec![
        env_var(env::BIND_ADDR, format!("0.0.0.0:{}", spec.listen_port)),
        env_var(env::ADVERTISED_HOST, advertised_host(proxy)?),
        env_var(env::ADVERTISED_PORT, spec.listen_port),
        env_var(env::BOOTSTRAP_SERVERS, spec.bootstrap_servers.join(",")),
        env_var(env::VIRTUAL_PARTITIONS, spec.virtual_partitions),
        env_var(env::PHYSICAL_PARTITIONS, spec.physical_partitions),
        env_var(env::METRICS_ADDR, format!("0.0.0.0:{}", spec.metrics_port)),
        env_var(env::CONNECT_TIMEOUT_MS, spec.kafka.connection_timeout_ms),
        env_var(env::REQUEST_TIMEOUT_MS, spec.kafka.request_timeout_ms),
        env_var(
            env::METADATA_REFRESH_MS,
            spec.kafka.metadata_refresh_interval_secs.saturating_mul(1000),
        ),
        env_var(env::MAX_CONNECTIONS, spec.max_connections),
        env_var(env::LOG_FILTER, &spec.logging.level),
        env_var(
            env::LOG_FORMAT,
            if spec.logging.json { "json" } else { "text" },
        ),
    ];
    if !spec.topic_overrides.is_empty() {
        vars.push(env_var(env::TOPIC_MAPPINGS, topic_mappings(spec)));
    }
    Ok(vars)
}

/// HTTP check against the proxy's admin port
fn http_check(path: &str, initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(METRICS_PORT_NAME.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn toleration(spec: &TolerationSpec) -> Toleration {
    Toleration {
        key: spec.key.clone(),
        operator: spec.operator.clone(),
        value: spec.value.clone(),
        effect: spec.effect.clone(),
        toleration_seconds: spec.toleration_seconds,
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    (!values.is_empty()).then(|| {
        values
            .iter()
            .map(|(name, amount)| (name.clone(), Quantity(amount.clone())))
            .collect()
    })
}

fn resource_requirements(spec: &ResourceRequirementsSpec) -> ResourceRequirements {
    ResourceRequirements {
        limits: quantities(&spec.limits),
        requests: quantities(&spec.requests),
        ..Default::default()
    }
}

fn non_empty(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

/// Scheduling and identity settings from the pod template
fn apply_pod_template(
    template: &PodTemplate,
    pod: &mut PodSpec,
    container: &mut Container,
) -> Result<()> {
    pod.node_selector = non_empty(&template.node_selector);
    if !template.tolerations.is_empty() {
        pod.tolerations = Some(template.tolerations.iter().map(toleration).collect());
    }
    pod.affinity = pod_affinity(template)?;
    pod.service_account_name = template.service_account_name.clone();
    if !template.image_pull_secrets.is_empty() {
        pod.image_pull_secrets = Some(
            template
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        );
    }

    container.resources = template.resources.as_ref().map(resource_requirements);
    container.image_pull_policy = template.image_pull_policy.clone();
    Ok(())
}

/// Desired Deployment. A suspended proxy gets zero replicas.
pub fn build_deployment(proxy: &VirtualPartitionProxy, default_image: &str) -> Result<Deployment> {
    let name = proxy.name_any();
    let spec = &proxy.spec;
    let labels = labels(&name);
    let replicas = if spec.suspend { 0 } else { spec.replicas };

    let mut container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| default_image.to_string())),
        env: Some(proxy_env(proxy)?),
        ports: Some(vec![
            ContainerPort {
                name: Some(KAFKA_PORT_NAME.to_string()),
                container_port: spec.listen_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some(METRICS_PORT_NAME.to_string()),
                container_port: spec.metrics_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(http_check("/readyz", 5, 5)),
        liveness_probe: Some(http_check("/healthz", 10, 10)),
        ..Default::default()
    };

    // Template labels and annotations first; ours override on collision
    let template = spec.pod_template.clone().unwrap_or_default();
    let mut pod_labels = template.labels.clone();
    pod_labels.extend(labels.clone());
    let mut pod_annotations = template.annotations.clone();
    pod_annotations.insert(CONFIG_HASH_ANNOTATION.to_string(), config_hash(spec)?);

    let mut pod = PodSpec::default();
    apply_pod_template(&template, &mut pod, &mut container)?;
    pod.containers = vec![container];

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace(proxy)?),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(proxy)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Desired Service: ClusterIP for internal exposure, LoadBalancer for external
pub fn build_service(proxy: &VirtualPartitionProxy) -> Result<Service> {
    let name = proxy.name_any();
    let spec = &proxy.spec;
    let labels = labels(&name);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace(proxy)?),
            labels: Some(labels.clone()),
            annotations: non_empty(&spec.service.annotations),
            owner_references: Some(vec![owner_reference(proxy)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(spec.exposure.service_type().to_string()),
            load_balancer_ip: spec.service.load_balancer_ip.clone(),
            external_traffic_policy: spec
                .service
                .external_traffic_policy
                .map(|policy| policy.as_str().to_string()),
            selector: Some(labels),
            ports: Some(vec![
                ServicePort {
                    name: Some(KAFKA_PORT_NAME.to_string()),
                    port: spec.listen_port,
                    target_port: Some(IntOrString::String(KAFKA_PORT_NAME.to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some(METRICS_PORT_NAME.to_string()),
                    port: spec.metrics_port,
                    target_port: Some(IntOrString::String(METRICS_PORT_NAME.to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_annotation<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

fn container_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)?
        .image
        .as_deref()
}

/// Whether `observed` already carries every field the operator manages.
///
/// Fields the API server defaults are ignored; the config hash stands in for
/// the environment derived from the spec.
pub fn deployment_matches(observed: &Deployment, desired: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    replicas(observed) == replicas(desired)
        && pod_annotation(observed, CONFIG_HASH_ANNOTATION)
            == pod_annotation(desired, CONFIG_HASH_ANNOTATION)
        && container_image(observed) == container_image(desired)
        && observed.metadata.owner_references == desired.metadata.owner_references
}

/// Every annotation in `desired` is present with the same value. Cloud
/// controllers add their own, which are left alone.
fn annotations_cover(observed: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let Some(wanted) = &desired.annotations else {
        return true;
    };
    let present = observed.annotations.as_ref();
    wanted
        .iter()
        .all(|(key, value)| present.and_then(|a| a.get(key)) == Some(value))
}

/// Unset desired fields are left to the API server's defaults
fn field_covers<T: PartialEq>(observed: &Option<T>, desired: &Option<T>) -> bool {
    desired.is_none() || observed == desired
}

pub fn service_matches(observed_service: &Service, desired_service: &Service) -> bool {
    let (Some(observed), Some(desired)) = (&observed_service.spec, &desired_service.spec) else {
        return false;
    };
    let ports = |s: &ServiceSpec| -> Vec<(Option<String>, i32, Option<IntOrString>)> {
        s.ports
            .iter()
            .flatten()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
            .collect()
    };
    observed.type_ == desired.type_
        && observed.selector == desired.selector
        && ports(observed) == ports(desired)
        && field_covers(&observed.load_balancer_ip, &desired.load_balancer_ip)
        && field_covers(
            &observed.external_traffic_policy,
            &desired.external_traffic_policy,
        )
        && annotations_cover(&observed_service.metadata, &desired_service.metadata)
}

pub fn ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Address clients should bootstrap from, once one is known.
///
/// External exposure has no endpoint until the load balancer reports an
/// ingress address.
pub fn endpoint(proxy: &VirtualPartitionProxy, service: &Service) -> Option<String> {
    let port = proxy.spec.listen_port;
    if let Some(host) = &proxy.spec.advertised_host {
        return Some(format!("{}:{}", host, port));
    }

    match proxy.spec.exposure {
        Exposure::Internal => service_host(proxy).ok().map(|h| format!("{}:{}", h, port)),
        Exposure::External => {
            let ingress = service
                .status
                .as_ref()?
                .load_balancer
                .as_ref()?
                .ingress
                .as_ref()?
                .first()?;
            let host = ingress.ip.as_ref().or(ingress.hostname.as_ref())?;
            Some(format!("{}:{}", host, port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ExternalTrafficPolicy, TopicOverride};
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};

    fn proxy(exposure: Exposure) -> VirtualPartitionProxy {
        let mut proxy = VirtualPartitionProxy::new(
            "orders",
            VirtualPartitionProxySpec {
                virtual_partitions: 100,
                physical_partitions: 10,
                replicas: 3,
                exposure,
                bootstrap_servers: vec!["kafka-0:9092".to_string(), "kafka-1:9092".to_string()],
                ..Default::default()
            },
        );
        proxy.metadata.namespace = Some("streaming".to_string());
        proxy.metadata.uid = Some("8b1f6a52-0000-4000-8000-000000000001".to_string());
        proxy
    }

    fn env_value(deployment: &Deployment, name: &str) -> Option<String> {
        deployment.spec.as_ref()?.template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .clone()
    }

    // ========================================================================
    // Config hash
    // ========================================================================

    #[test]
    fn test_config_hash_is_stable_and_short() {
        let p = proxy(Exposure::Internal);
        let hash = config_hash(&p.spec).unwrap();
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, config_hash(&p.spec).unwrap());
    }

    #[test]
    fn test_config_hash_tracks_spec() {
        let p = proxy(Exposure::Internal);
        let mut changed = p.spec.clone();
        changed.bootstrap_servers.push("kafka-2:9092".to_string());
        assert_ne!(config_hash(&p.spec).unwrap(), config_hash(&changed).unwrap());
    }

    // ========================================================================
    // Deployment
    // ========================================================================

    #[test]
    fn test_deployment_carries_proxy_config() {
        let p = proxy(Exposure::Internal);
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("orders"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("streaming"));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(3));
        assert_eq!(container_image(&deployment), Some("partmux/proxy:1.0"));
        assert_eq!(
            env_value(&deployment, "PARTMUX_VIRTUAL_PARTITIONS").as_deref(),
            Some("100")
        );
        assert_eq!(
            env_value(&deployment, "PARTMUX_PHYSICAL_PARTITIONS").as_deref(),
            Some("10")
        );
        assert_eq!(
            env_value(&deployment, "PARTMUX_BOOTSTRAP_SERVERS").as_deref(),
            Some("kafka-0:9092,kafka-1:9092")
        );
        assert_eq!(
            env_value(&deployment, "PARTMUX_ADVERTISED_HOST").as_deref(),
            Some("orders.streaming.svc.cluster.local")
        );
        assert_eq!(
            pod_annotation(&deployment, CONFIG_HASH_ANNOTATION),
            Some(config_hash(&p.spec).unwrap().as_str())
        );

        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "VirtualPartitionProxy");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_connection_and_logging_env() {
        let mut p = proxy(Exposure::Internal);
        p.spec.max_connections = 250;
        p.spec.kafka.request_timeout_ms = 5000;
        p.spec.kafka.metadata_refresh_interval_secs = 45;
        p.spec.logging.level = "debug".to_string();
        p.spec.logging.json = true;
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();

        let value = |name| env_value(&deployment, name);
        assert_eq!(value("PARTMUX_MAX_CONNECTIONS").as_deref(), Some("250"));
        assert_eq!(value("PARTMUX_REQUEST_TIMEOUT_MS").as_deref(), Some("5000"));
        assert_eq!(value("PARTMUX_CONNECT_TIMEOUT_MS").as_deref(), Some("10000"));
        assert_eq!(value("PARTMUX_METADATA_REFRESH_MS").as_deref(), Some("45000"));
        assert_eq!(value("RUST_LOG").as_deref(), Some("debug"));
        assert_eq!(value("PARTMUX_LOG_FORMAT").as_deref(), Some("json"));
        // No overrides, no variable
        assert_eq!(value("PARTMUX_TOPIC_MAPPINGS"), None);
    }

    #[test]
    fn test_topic_overrides_env() {
        let mut p = proxy(Exposure::Internal);
        p.spec.topic_overrides = vec![
            TopicOverride {
                topic: "audit".to_string(),
                virtual_partitions: Some(40),
                physical_partitions: Some(4),
            },
            TopicOverride {
                topic: "events".to_string(),
                virtual_partitions: None,
                physical_partitions: Some(5),
            },
        ];
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();
        assert_eq!(
            env_value(&deployment, "PARTMUX_TOPIC_MAPPINGS").as_deref(),
            Some("audit=40:4,events=100:5")
        );
    }

    #[test]
    fn test_health_checks_use_admin_port() {
        let deployment = build_deployment(&proxy(Exposure::Internal), "partmux/proxy:1.0").unwrap();
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];

        let readiness = container.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(readiness.path.as_deref(), Some("/readyz"));
        assert_eq!(readiness.port, IntOrString::String("metrics".to_string()));

        let liveness = container.liveness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(liveness.path.as_deref(), Some("/healthz"));
    }

    #[test]
    fn test_pod_template_is_rendered() {
        let mut p = proxy(Exposure::Internal);
        p.spec.pod_template = Some(PodTemplate {
            annotations: BTreeMap::from([("team".to_string(), "streaming".to_string())]),
            labels: BTreeMap::from([
                ("tier".to_string(), "edge".to_string()),
                ("app.kubernetes.io/name".to_string(), "other".to_string()),
            ]),
            node_selector: BTreeMap::from([("workload".to_string(), "kafka".to_string())]),
            tolerations: vec![TolerationSpec {
                key: Some("dedicated".to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }],
            affinity: Some(serde_json::json!({ "podAntiAffinity": {} })),
            resources: Some(ResourceRequirementsSpec {
                limits: BTreeMap::from([("memory".to_string(), "512Mi".to_string())]),
                requests: BTreeMap::from([("cpu".to_string(), "250m".to_string())]),
            }),
            image_pull_policy: Some("Always".to_string()),
            image_pull_secrets: vec!["registry".to_string()],
            service_account_name: Some("partmux".to_string()),
        });
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();
        let template = deployment.spec.unwrap().template;

        let metadata = template.metadata.unwrap();
        let pod_labels = metadata.labels.unwrap();
        assert_eq!(pod_labels["tier"], "edge");
        assert_eq!(pod_labels["app.kubernetes.io/name"], "partmux-proxy");
        let annotations = metadata.annotations.unwrap();
        assert_eq!(annotations["team"], "streaming");
        assert!(annotations.contains_key(CONFIG_HASH_ANNOTATION));

        let pod = template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap()["workload"], "kafka");
        let tolerations = pod.tolerations.unwrap();
        assert_eq!(tolerations[0].key.as_deref(), Some("dedicated"));
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));
        assert!(pod.affinity.unwrap().pod_anti_affinity.is_some());
        assert_eq!(pod.service_account_name.as_deref(), Some("partmux"));
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "registry");

        let container = &pod.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("512Mi".to_string())
        );
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("250m".to_string())
        );
    }

    #[test]
    fn test_invalid_affinity_is_reported() {
        let mut p = proxy(Exposure::Internal);
        p.spec.pod_template = Some(PodTemplate {
            affinity: Some(serde_json::json!({ "podAntiAffinity": 3 })),
            ..Default::default()
        });
        let err = build_deployment(&p, "partmux/proxy:1.0").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_suspended_deployment_has_no_replicas() {
        let mut p = proxy(Exposure::Internal);
        p.spec.suspend = true;
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn test_spec_image_overrides_default() {
        let mut p = proxy(Exposure::Internal);
        p.spec.image = Some("registry.local/partmux:dev".to_string());
        let deployment = build_deployment(&p, "partmux/proxy:1.0").unwrap();
        assert_eq!(container_image(&deployment), Some("registry.local/partmux:dev"));
    }

    #[test]
    fn test_missing_uid_is_reported() {
        let mut p = proxy(Exposure::Internal);
        p.metadata.uid = None;
        let err = build_deployment(&p, "partmux/proxy:1.0").unwrap_err();
        assert!(matches!(err, Error::MissingObjectKey("metadata.uid")));
    }

    #[test]
    fn test_deployment_matches_ignores_server_defaults() {
        let p = proxy(Exposure::Internal);
        let desired = build_deployment(&p, "partmux/proxy:1.0").unwrap();
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().revision_history_limit = Some(10);
        assert!(deployment_matches(&observed, &desired));

        let mut scaled = p.clone();
        scaled.spec.replicas = 5;
        let rescaled = build_deployment(&scaled, "partmux/proxy:1.0").unwrap();
        assert!(!deployment_matches(&observed, &rescaled));
    }

    // ========================================================================
    // Service
    // ========================================================================

    #[test]
    fn test_service_type_follows_exposure() {
        let internal = build_service(&proxy(Exposure::Internal)).unwrap();
        let external = build_service(&proxy(Exposure::External)).unwrap();
        assert_eq!(internal.spec.as_ref().unwrap().type_.as_deref(), Some("ClusterIP"));
        assert_eq!(external.spec.as_ref().unwrap().type_.as_deref(), Some("LoadBalancer"));
        assert!(!service_matches(&internal, &external));
        assert!(service_matches(&internal, &internal.clone()));
    }

    #[test]
    fn test_service_options_are_rendered() {
        let mut p = proxy(Exposure::External);
        p.spec.service.annotations = BTreeMap::from([(
            "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
            "nlb".to_string(),
        )]);
        p.spec.service.load_balancer_ip = Some("203.0.113.10".to_string());
        p.spec.service.external_traffic_policy = Some(ExternalTrafficPolicy::Local);
        let desired = build_service(&p).unwrap();

        let spec = desired.spec.as_ref().unwrap();
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("203.0.113.10"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
        assert_eq!(
            desired.metadata.annotations.as_ref().unwrap()
                ["service.beta.kubernetes.io/aws-load-balancer-type"],
            "nlb"
        );

        // Extra annotations from a cloud controller are tolerated
        let mut observed = desired.clone();
        observed
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("cloud.example.com/lb-id".to_string(), "lb-123".to_string());
        assert!(service_matches(&observed, &desired));

        // A changed traffic policy or a dropped annotation is drift
        let mut policy_changed = observed.clone();
        policy_changed.spec.as_mut().unwrap().external_traffic_policy =
            Some("Cluster".to_string());
        assert!(!service_matches(&policy_changed, &desired));

        let mut unannotated = observed.clone();
        unannotated.metadata.annotations = None;
        assert!(!service_matches(&unannotated, &desired));
    }

    #[test]
    fn test_unset_service_options_accept_server_defaults() {
        let p = proxy(Exposure::External);
        let desired = build_service(&p).unwrap();
        let mut observed = desired.clone();
        observed.spec.as_mut().unwrap().external_traffic_policy = Some("Cluster".to_string());
        assert!(service_matches(&observed, &desired));
    }

    #[test]
    fn test_metrics_endpoint() {
        let p = proxy(Exposure::External);
        assert_eq!(
            metrics_endpoint(&p).unwrap(),
            "http://orders.streaming.svc.cluster.local:9090/metrics"
        );
    }

    #[test]
    fn test_internal_endpoint() {
        let p = proxy(Exposure::Internal);
        let service = build_service(&p).unwrap();
        assert_eq!(
            endpoint(&p, &service).as_deref(),
            Some("orders.streaming.svc.cluster.local:9092")
        );
    }

    #[test]
    fn test_external_endpoint_waits_for_ingress() {
        let p = proxy(Exposure::External);
        let mut service = build_service(&p).unwrap();
        assert_eq!(endpoint(&p, &service), None);

        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some("203.0.113.7".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        assert_eq!(endpoint(&p, &service).as_deref(), Some("203.0.113.7:9092"));
    }

    #[test]
    fn test_advertised_host_wins() {
        let mut p = proxy(Exposure::External);
        p.spec.advertised_host = Some("kafka.example.com".to_string());
        let service = build_service(&p).unwrap();
        assert_eq!(endpoint(&p, &service).as_deref(), Some("kafka.example.com:9092"));
    }
}
