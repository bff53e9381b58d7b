//! `VirtualPartitionProxy` custom resource
//!
//! ```yaml
//! apiVersion: partmux.io/v1alpha1
//! kind: VirtualPartitionProxy
//! metadata:
//!   name: orders
//! spec:
//!   virtualPartitions: 100
//!   physicalPartitions: 10
//!   replicas: 3
//!   exposure: Internal
//!   bootstrapServers: ["kafka-0.kafka:9092", "kafka-1.kafka:9092"]
//!   topicOverrides:
//!     - topic: audit
//!       virtualPartitions: 40
//!       physicalPartitions: 4
//!   logging:
//!     level: debug
//!     json: true
//!   podTemplate:
//!     nodeSelector:
//!       workload: streaming
//!     resources:
//!       requests: { cpu: 500m, memory: 256Mi }
//! ```

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_PORT: i32 = 9092;
pub const DEFAULT_METRICS_PORT: i32 = 9090;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1000;

/// Desired state of a proxy deployment
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "partmux.io",
    version = "v1alpha1",
    kind = "VirtualPartitionProxy",
    plural = "virtualpartitionproxies",
    singular = "virtualpartitionproxy",
    shortname = "vpp",
    namespaced,
    status = "VirtualPartitionProxyStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Virtual", "type": "integer", "jsonPath": ".spec.virtualPartitions"}"#,
    printcolumn = r#"{"name": "Physical", "type": "integer", "jsonPath": ".spec.physicalPartitions"}"#,
    printcolumn = r#"{"name": "Ready", "type": "integer", "jsonPath": ".status.readyReplicas"}"#,
    printcolumn = r#"{"name": "Endpoint", "type": "string", "jsonPath": ".status.endpoint"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPartitionProxySpec {
    /// Partitions clients see
    pub virtual_partitions: i32,

    /// Partitions of the backing topics; must divide `virtual_partitions`
    pub physical_partitions: i32,

    /// Proxy pods to run
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub exposure: Exposure,

    /// Brokers of the physical cluster
    pub bootstrap_servers: Vec<String>,

    #[serde(default = "default_listen_port")]
    pub listen_port: i32,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: i32,

    /// Proxy image; the operator's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Host clients reconnect to; the Service DNS name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_host: Option<String>,

    /// Scale the proxy to zero while keeping its Service
    #[serde(default)]
    pub suspend: bool,

    /// Concurrent client connections per pod; 0 for no limit
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Backend connection settings
    #[serde(default)]
    pub kafka: KafkaConnectionSpec,

    /// Topics mapped with their own partition counts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_overrides: Vec<TopicOverride>,

    #[serde(default)]
    pub logging: LoggingSpec,

    /// Extra settings for the proxy Service
    #[serde(default)]
    pub service: ServiceOptions,

    /// Pod scheduling and runtime customizations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,
}

impl Default for VirtualPartitionProxySpec {
    fn default() -> Self {
        Self {
            virtual_partitions: 0,
            physical_partitions: 0,
            replicas: default_replicas(),
            exposure: Exposure::default(),
            bootstrap_servers: Vec::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            image: None,
            advertised_host: None,
            suspend: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            kafka: KafkaConnectionSpec::default(),
            topic_overrides: Vec::new(),
            logging: LoggingSpec::default(),
            service: ServiceOptions::default(),
            pod_template: None,
        }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_listen_port() -> i32 {
    DEFAULT_LISTEN_PORT
}

fn default_metrics_port() -> i32 {
    DEFAULT_METRICS_PORT
}

/// Timeouts and refresh cadence for connections to the physical cluster
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkaConnectionSpec {
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Deadline for one client request, backend round-trips included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long partition leaders are trusted before being re-learned; 0
    /// keeps them until a broker reports them stale
    #[serde(default = "default_metadata_refresh_interval_secs")]
    pub metadata_refresh_interval_secs: u64,
}

impl Default for KafkaConnectionSpec {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            metadata_refresh_interval_secs: default_metadata_refresh_interval_secs(),
        }
    }
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_refresh_interval_secs() -> u64 {
    30
}

/// Partition counts for one topic; unset counts come from the resource
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopicOverride {
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_partitions: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_partitions: Option<i32>,
}

impl TopicOverride {
    /// Virtual and physical counts, falling back to the resource-wide ones
    pub fn counts(&self, spec: &VirtualPartitionProxySpec) -> (i32, i32) {
        (
            self.virtual_partitions.unwrap_or(spec.virtual_partitions),
            self.physical_partitions.unwrap_or(spec.physical_partitions),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// One JSON object per log line
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOptions {
    /// Copied onto the Service, e.g. cloud load balancer settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(
        default,
        rename = "loadBalancerIP",
        skip_serializing_if = "Option::is_none"
    )]
    pub load_balancer_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<ExternalTrafficPolicy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ExternalTrafficPolicy {
    Cluster,
    Local,
}

impl ExternalTrafficPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExternalTrafficPolicy::Cluster => "Cluster",
            ExternalTrafficPolicy::Local => "Local",
        }
    }
}

/// Customizations applied to the proxy pods
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Added to the operator's own labels, which take precedence
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<TolerationSpec>,

    /// Kubernetes `Affinity`, passed through as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,

    /// Always, IfNotPresent or Never
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Names of image pull secrets in the resource's namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TolerationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Exists or Equal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// NoSchedule, PreferNoSchedule or NoExecute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Container resources as quantity strings, e.g. `cpu: 500m`
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// Free-form object schema the API server stores without pruning
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// How the proxy Service is reachable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Exposure {
    /// ClusterIP Service
    #[default]
    Internal,
    /// LoadBalancer Service
    External,
}

impl Exposure {
    pub fn service_type(self) -> &'static str {
        match self {
            Exposure::Internal => "ClusterIP",
            Exposure::External => "LoadBalancer",
        }
    }
}

/// Lifecycle phase reported in status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Reconciling,
    Ready,
    /// Was ready for the current spec and has since lost replicas
    Degraded,
    Failed,
}

/// Condition types reported in status
pub mod condition {
    pub const CONFIG_VALID: &str = "ConfigValid";
    pub const DEPLOYMENT_AVAILABLE: &str = "DeploymentAvailable";
    pub const READY: &str = "Ready";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// CamelCase reason for the current status
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 time the status last flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Observed state of a proxy deployment
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPartitionProxyStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub ready_replicas: i32,

    /// Address clients bootstrap from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Prometheus scrape URL of the proxy Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec this status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
