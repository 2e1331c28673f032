//! Configuration for the DT Management module.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::address::Topology;

/// Root configuration of the DT Management module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DtManagementConfig {
    /// Hostname used in externally visible endpoints.
    pub hostname: String,
    /// Port of the orchestrator's own HTTP surface, used for proxied endpoints; proxied
    /// endpoints carry no port when unset or 0.
    pub external_port: Option<u16>,
    /// Expose digital twins through the orchestrator's `/digital-twins/{id}` proxy.
    pub use_proxy: bool,
    /// Expose digital twins by container name instead of host port.
    pub expose_via_container_name: bool,
    /// Where the orchestrator itself runs.
    pub host_deployment: Topology,
    pub docker: DockerConfig,
    pub runtime: RuntimeConfig,
    pub events: ModuleEventsConfig,
    pub kafka: KafkaConfig,
    pub readiness: ReadinessConfig,
    pub catalog: CatalogConfig,
}

impl Default for DtManagementConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            external_port: Some(8080),
            use_proxy: false,
            expose_via_container_name: false,
            host_deployment: Topology::Internal,
            docker: DockerConfig::default(),
            runtime: RuntimeConfig::default(),
            events: ModuleEventsConfig::default(),
            kafka: KafkaConfig::default(),
            readiness: ReadinessConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DockerConfig {
    /// Name of the orchestrator's own container when it runs containerized.
    pub container_name: String,
    /// Network to attach containers to; resolved against the orchestrator's own networks.
    pub network: Option<String>,
    pub image: String,
    pub restart_policy: String,
    pub module_container_prefix: String,
    pub service_container_prefix: String,
    /// Forward container stdout/stderr into the orchestrator log.
    pub include_logs: bool,
    /// Upper bound for a single container engine call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_name: "dt-management".to_owned(),
            network: None,
            image: "ghcr.io/modapto/digital-twin:latest".to_owned(),
            restart_policy: "unless-stopped".to_owned(),
            module_container_prefix: "modapto-module-".to_owned(),
            service_container_prefix: "modapto-service-".to_owned(),
            include_logs: false,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// How co-located runtimes are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Runtime executable; co-located deployments fail fast when unset.
    pub executable: Option<PathBuf>,
    /// Arguments; `{model}`, `{config}` and `{port}` are substituted.
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Grace period between SIGTERM and a forced kill.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: vec![
                "-m".to_owned(),
                "{model}".to_owned(),
                "-c".to_owned(),
                "{config}".to_owned(),
            ],
            working_directory: None,
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// Inbound module event bus and forwarding pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModuleEventsConfig {
    pub mqtt_host: String,
    /// Host modules use to reach the bus when both sides are containerized.
    pub mqtt_host_from_container: Option<String>,
    /// Port of the module bus; 0 lets the embedded broker pick a free one.
    pub mqtt_port: u16,
    /// Run the module bus broker in-process on `mqtt_host:mqtt_port`.
    pub embedded_broker: bool,
    /// Largest accepted event payload in bytes.
    pub max_message_size: usize,
    pub queue_size: usize,
    pub thread_count: usize,
    /// Subscribe to the module bus on startup.
    pub listen: bool,
}

impl Default for ModuleEventsConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_owned(),
            mqtt_host_from_container: None,
            mqtt_port: 1883,
            embedded_broker: true,
            max_message_size: 268_435_456,
            queue_size: 100,
            thread_count: 1,
            listen: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KafkaConfig {
    pub bootstrap_servers: Vec<String>,
    pub queue_size: usize,
    pub thread_count: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_owned()],
            queue_size: 100,
            thread_count: 1,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReadinessConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            interval: Duration::from_millis(500),
        }
    }
}

/// External service catalogue used to assign services by catalogue id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CatalogConfig {
    /// Base URL such as `http://catalogue:8080`; catalogue lookups are disabled when unset.
    pub host: Option<String>,
    /// Entry path; `{id}` is replaced by the catalogue id.
    pub path: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            host: None,
            path: "/services/{id}".to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Serde adapter for human readable durations such as `500ms` or `2m`.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let cfg = DtManagementConfig::default();
        assert_eq!(cfg.hostname, "localhost");
        assert_eq!(cfg.docker.module_container_prefix, "modapto-module-");
        assert_eq!(cfg.events.queue_size, 100);
        assert_eq!(cfg.events.mqtt_port, 1883);
        assert!(cfg.events.embedded_broker);
        assert!(cfg.catalog.host.is_none());
        assert_eq!(cfg.readiness.timeout, Duration::from_secs(100));
        assert_eq!(cfg.readiness.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: DtManagementConfig = serde_json::from_value(json!({
            "host_deployment": "container",
            "readiness": {"timeout": "5s"},
            "docker": {"network": "dt-net", "call_timeout": "30s"}
        }))
        .unwrap();
        assert_eq!(cfg.host_deployment, Topology::Container);
        assert_eq!(cfg.readiness.timeout, Duration::from_secs(5));
        assert_eq!(cfg.readiness.interval, Duration::from_millis(500));
        assert_eq!(cfg.docker.network.as_deref(), Some("dt-net"));
        assert_eq!(cfg.docker.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<DtManagementConfig, _> =
            serde_json::from_value(json!({"hostnme": "typo"}));
        assert!(result.is_err());
    }
}
