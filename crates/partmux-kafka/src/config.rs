//! Proxy configuration and shared state

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use partmux_core::offset_index::DEFAULT_ANCHOR_CAPACITY;
use partmux_core::{OffsetIndex, PartitionMapping};

use crate::error::{ProxyError, ProxyResult};
use crate::retry::RetryPolicy;

/// Environment variables read by [`ProxyConfig::from_env`]
pub mod env {
    pub const BIND_ADDR: &str = "PARTMUX_BIND_ADDR";
    pub const ADVERTISED_HOST: &str = "PARTMUX_ADVERTISED_HOST";
    pub const ADVERTISED_PORT: &str = "PARTMUX_ADVERTISED_PORT";
    pub const NODE_ID: &str = "PARTMUX_NODE_ID";
    pub const CLUSTER_ID: &str = "PARTMUX_CLUSTER_ID";
    pub const BOOTSTRAP_SERVERS: &str = "PARTMUX_BOOTSTRAP_SERVERS";
    pub const VIRTUAL_PARTITIONS: &str = "PARTMUX_VIRTUAL_PARTITIONS";
    pub const PHYSICAL_PARTITIONS: &str = "PARTMUX_PHYSICAL_PARTITIONS";
    pub const REQUEST_TIMEOUT_MS: &str = "PARTMUX_REQUEST_TIMEOUT_MS";
    pub const CONNECT_TIMEOUT_MS: &str = "PARTMUX_CONNECT_TIMEOUT_MS";
    pub const METADATA_REFRESH_MS: &str = "PARTMUX_METADATA_REFRESH_MS";
    pub const MAX_CONNECTIONS: &str = "PARTMUX_MAX_CONNECTIONS";
    pub const TOPIC_MAPPINGS: &str = "PARTMUX_TOPIC_MAPPINGS";
    pub const MAX_IN_FLIGHT: &str = "PARTMUX_MAX_IN_FLIGHT";
    pub const INDEX_CAPACITY: &str = "PARTMUX_INDEX_CAPACITY";
    pub const FETCH_MAX_ROUNDS: &str = "PARTMUX_FETCH_MAX_ROUNDS";
    pub const RETRY_ATTEMPTS: &str = "PARTMUX_RETRY_ATTEMPTS";
    pub const METRICS_ADDR: &str = "PARTMUX_METRICS_ADDR";
    pub const SHUTDOWN_TIMEOUT_MS: &str = "PARTMUX_SHUTDOWN_TIMEOUT_MS";
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to accept client connections on
    pub bind_addr: String,
    /// Host clients are told to connect to
    pub advertised_host: String,
    /// Port clients are told to connect to
    pub advertised_port: i32,
    /// Node id the proxy reports for itself
    pub node_id: i32,
    /// Cluster id reported in Metadata responses
    pub cluster_id: String,
    /// Physical cluster brokers (`host:port`)
    pub bootstrap_servers: Vec<String>,
    /// Virtual partitions exposed per topic (V)
    pub virtual_partitions: i32,
    /// Physical partitions expected per topic (P)
    pub physical_partitions: i32,
    /// Deadline for a client request, backend round-trips included
    pub request_timeout: Duration,
    /// Deadline for establishing a backend connection
    pub connect_timeout: Duration,
    /// Age after which a session re-learns partition leaders; zero keeps
    /// them until a broker reports them stale
    pub metadata_refresh_interval: Duration,
    /// Concurrent client connections; zero means unlimited
    pub max_connections: usize,
    /// Topics mapped with their own partition counts
    pub topic_mappings: Vec<TopicMapping>,
    /// Requests read from one client before the session waits for responses
    pub max_in_flight: usize,
    /// Offset index anchors kept per physical partition
    pub index_capacity: usize,
    /// Physical fetches per virtual partition and client Fetch
    pub fetch_max_rounds: usize,
    /// Backoff for backend connection failures
    pub retry: RetryPolicy,
    /// Address of the Prometheus endpoint
    pub metrics_addr: String,
    /// Time sessions get to drain on shutdown
    pub shutdown_timeout: Duration,
    /// Client id sent to brokers
    pub client_id: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9092".to_string(),
            advertised_host: "localhost".to_string(),
            advertised_port: 9092,
            node_id: 0,
            cluster_id: "partmux".to_string(),
            bootstrap_servers: vec!["localhost:9093".to_string()],
            virtual_partitions: 100,
            physical_partitions: 10,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            metadata_refresh_interval: Duration::from_secs(30),
            max_connections: 1000,
            topic_mappings: Vec::new(),
            max_in_flight: 64,
            index_capacity: DEFAULT_ANCHOR_CAPACITY,
            fetch_max_rounds: 8,
            retry: RetryPolicy::default(),
            metrics_addr: "0.0.0.0:9090".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            client_id: "partmux".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Build a configuration from `PARTMUX_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> ProxyResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> ProxyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let bootstrap_servers = match lookup(env::BOOTSTRAP_SERVERS) {
            Some(value) => {
                let servers: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if servers.is_empty() {
                    return Err(ProxyError::Config(format!(
                        "{} must list at least one broker",
                        env::BOOTSTRAP_SERVERS
                    )));
                }
                servers
            }
            None => defaults.bootstrap_servers,
        };

        let retry = RetryPolicy {
            max_retries: parse_var(&lookup, env::RETRY_ATTEMPTS, defaults.retry.max_retries)?,
            ..defaults.retry
        };

        let config = Self {
            bind_addr: lookup(env::BIND_ADDR).unwrap_or(defaults.bind_addr),
            advertised_host: lookup(env::ADVERTISED_HOST).unwrap_or(defaults.advertised_host),
            advertised_port: parse_var(&lookup, env::ADVERTISED_PORT, defaults.advertised_port)?,
            node_id: parse_var(&lookup, env::NODE_ID, defaults.node_id)?,
            cluster_id: lookup(env::CLUSTER_ID).unwrap_or(defaults.cluster_id),
            bootstrap_servers,
            virtual_partitions: parse_var(
                &lookup,
                env::VIRTUAL_PARTITIONS,
                defaults.virtual_partitions,
            )?,
            physical_partitions: parse_var(
                &lookup,
                env::PHYSICAL_PARTITIONS,
                defaults.physical_partitions,
            )?,
            request_timeout: parse_millis(
                &lookup,
                env::REQUEST_TIMEOUT_MS,
                defaults.request_timeout,
            )?,
            connect_timeout: parse_millis(
                &lookup,
                env::CONNECT_TIMEOUT_MS,
                defaults.connect_timeout,
            )?,
            metadata_refresh_interval: parse_millis(
                &lookup,
                env::METADATA_REFRESH_MS,
                defaults.metadata_refresh_interval,
            )?,
            max_connections: parse_var(&lookup, env::MAX_CONNECTIONS, defaults.max_connections)?,
            topic_mappings: match lookup(env::TOPIC_MAPPINGS) {
                Some(value) => TopicMapping::parse_list(&value)?,
                None => defaults.topic_mappings,
            },
            max_in_flight: parse_var(&lookup, env::MAX_IN_FLIGHT, defaults.max_in_flight)?.max(1),
            index_capacity: parse_var(&lookup, env::INDEX_CAPACITY, defaults.index_capacity)?,
            fetch_max_rounds: parse_var(&lookup, env::FETCH_MAX_ROUNDS, defaults.fetch_max_rounds)?
                .max(1),
            retry,
            metrics_addr: lookup(env::METRICS_ADDR).unwrap_or(defaults.metrics_addr),
            shutdown_timeout: parse_millis(
                &lookup,
                env::SHUTDOWN_TIMEOUT_MS,
                defaults.shutdown_timeout,
            )?,
            client_id: defaults.client_id,
        };

        config.mapping()?;
        config.topic_mapping_table()?;
        Ok(config)
    }

    /// The validated partition mapping for this configuration
    pub fn mapping(&self) -> ProxyResult<PartitionMapping> {
        Ok(PartitionMapping::new(
            self.virtual_partitions,
            self.physical_partitions,
        )?)
    }

    /// Validated mappings of the topics that override the default one
    pub fn topic_mapping_table(&self) -> ProxyResult<HashMap<String, PartitionMapping>> {
        let mut table = HashMap::with_capacity(self.topic_mappings.len());
        for topic in &self.topic_mappings {
            let mapping = PartitionMapping::new(topic.virtual_partitions, topic.physical_partitions)?;
            if table.insert(topic.topic.clone(), mapping).is_some() {
                return Err(ProxyError::Config(format!(
                    "topic {:?} is mapped twice",
                    topic.topic
                )));
            }
        }
        Ok(table)
    }
}

/// Partition counts for one topic that differ from the proxy-wide mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMapping {
    pub topic: String,
    pub virtual_partitions: i32,
    pub physical_partitions: i32,
}

impl TopicMapping {
    /// Parse `topic=V:P` entries separated by commas, e.g.
    /// `orders=120:12,audit=40:4`
    pub fn parse_list(value: &str) -> ProxyResult<Vec<Self>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }

    fn parse(entry: &str) -> ProxyResult<Self> {
        let invalid = || {
            ProxyError::Config(format!(
                "{} entry {:?} is not topic=virtual:physical",
                env::TOPIC_MAPPINGS,
                entry
            ))
        };

        let (topic, counts) = entry.split_once('=').ok_or_else(invalid)?;
        let (virtual_partitions, physical_partitions) =
            counts.split_once(':').ok_or_else(invalid)?;
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            topic: topic.to_string(),
            virtual_partitions: virtual_partitions.trim().parse().map_err(|_| invalid())?,
            physical_partitions: physical_partitions.trim().parse().map_err(|_| invalid())?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> ProxyResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| ProxyError::Config(format!("{}={:?}: {}", name, value, e))),
        None => Ok(default),
    }
}

fn parse_millis<F>(lookup: &F, name: &str, default: Duration) -> ProxyResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = default.as_millis() as u64;
    parse_var(lookup, name, default_ms).map(Duration::from_millis)
}

/// State shared by every session of a proxy process
pub struct ProxyState {
    pub config: ProxyConfig,
    /// Mapping of every topic without an override
    pub mapping: PartitionMapping,
    topic_mappings: HashMap<String, PartitionMapping>,
    pub index: OffsetIndex,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let mapping = config.mapping()?;
        let topic_mappings = config.topic_mapping_table()?;
        let index = OffsetIndex::new(config.index_capacity);
        Ok(Self {
            config,
            mapping,
            topic_mappings,
            index,
        })
    }

    /// Mapping that applies to `topic`
    pub fn mapping_for(&self, topic: &str) -> &PartitionMapping {
        self.topic_mappings.get(topic).unwrap_or(&self.mapping)
    }
}
