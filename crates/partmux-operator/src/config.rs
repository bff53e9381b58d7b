//! Operator configuration

pub const METRICS_ADDR_ENV: &str = "PARTMUX_OPERATOR_METRICS_ADDR";
pub const PROXY_IMAGE_ENV: &str = "PARTMUX_PROXY_IMAGE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Address of the operator's Prometheus endpoint
    pub metrics_addr: String,
    /// Image for proxies whose spec names none
    pub proxy_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_addr: "0.0.0.0:9091".to_string(),
            proxy_image: "ghcr.io/partmux/partmux-proxy:latest".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            metrics_addr: non_empty(METRICS_ADDR_ENV).unwrap_or(defaults.metrics_addr),
            proxy_image: non_empty(PROXY_IMAGE_ENV).unwrap_or(defaults.proxy_image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(OperatorConfig::from_lookup(|_| None), OperatorConfig::default());
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            (PROXY_IMAGE_ENV, "registry.local/partmux:1.2".to_string()),
            (METRICS_ADDR_ENV, " ".to_string()),
        ]);
        let config = OperatorConfig::from_lookup(|name| vars.get(name).cloned());
        assert_eq!(config.proxy_image, "registry.local/partmux:1.2");
        assert_eq!(config.metrics_addr, OperatorConfig::default().metrics_addr);
    }
}
