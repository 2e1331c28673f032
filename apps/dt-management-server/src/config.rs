//! Layered server configuration: defaults, then YAML, then `APP__*` environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, ensure};
use dt_management::DtManagementConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub dt_management: DtManagementConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub console_level: String,
    /// JSON log file; no file sink when unset.
    pub file: Option<PathBuf>,
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_level: "info".to_owned(),
            file: None,
            file_level: "debug".to_owned(),
        }
    }
}

impl LoggingConfig {
    /// # Errors
    /// Unknown level names.
    pub fn console_level(&self) -> Result<Level> {
        parse_level(&self.console_level)
    }

    /// # Errors
    /// Unknown level names.
    pub fn file_level(&self) -> Result<Level> {
        parse_level(&self.file_level)
    }
}

fn parse_level(name: &str) -> Result<Level> {
    Level::from_str(name).with_context(|| format!("invalid log level '{name}'"))
}

impl AppConfig {
    /// Loads `config_path` on top of the defaults; environment variables such as
    /// `APP__DT_MANAGEMENT__HOSTNAME=twins.local` override both.
    ///
    /// # Errors
    /// Unreadable or invalid configuration.
    pub fn load_layered(config_path: &Path) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Yaml},
        };

        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
            .context("Failed to extract config from figment")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// A given path that is not a file, or any [`Self::load_layered`] error.
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            ensure!(
                path.is_file(),
                "config file does not exist: {}",
                path.to_string_lossy()
            );
            Self::load_layered(path)
        } else {
            Ok(Self::default())
        }
    }

    /// # Errors
    /// Invalid log levels, an empty worker pool or an external broker without a port.
    pub fn validate(&self) -> Result<()> {
        self.logging.console_level()?;
        self.logging.file_level()?;
        let dt = &self.dt_management;
        ensure!(dt.events.thread_count > 0, "events.thread_count must be positive");
        ensure!(dt.kafka.thread_count > 0, "kafka.thread_count must be positive");
        ensure!(
            dt.events.embedded_broker || dt.events.mqtt_port > 0,
            "events.mqtt_port must be set when events.embedded_broker is disabled"
        );
        ensure!(
            !dt.readiness.interval.is_zero(),
            "readiness.interval must be positive"
        );
        Ok(())
    }

    /// # Errors
    /// Serialization failures.
    pub fn to_yaml(&self) -> Result<String> {
        serde_saphyr::to_string(self).context("Failed to serialize config to YAML")
    }

    /// `-v` raises the console level to debug, `-vv` and more to trace.
    pub fn apply_cli_overrides(&mut self, verbose: u8) {
        match verbose {
            0 => {}
            1 => "debug".clone_into(&mut self.logging.console_level),
            _ => "trace".clone_into(&mut self.logging.console_level),
        }
    }
}
