//! Run configuration, loaded from the `[ibecho]` table of a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::ctrl::{ConnectOptions, MetadataListener};
use crate::rdma::endpoint::EndpointParams;
use crate::rdma::types::*;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config")]
    Parse(#[from] toml::de::Error),

    #[error("`[ibecho]` table not found")]
    MissingTable,

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_port() -> u16 {
    MetadataListener::DEFAULT_PORT
}

fn default_ib_port() -> PortNum {
    1
}

fn default_buf_size() -> u32 {
    65536
}

fn default_tx_depth() -> u32 {
    100
}

fn default_service_level() -> u8 {
    1
}

fn default_payload() -> String {
    "MA KORE MOTEK".to_owned()
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_retry_interval_ms() -> u64 {
    200
}

fn default_completion_timeout_ms() -> u64 {
    5000
}

fn default_wait_timeout_ms() -> u64 {
    30000
}

/// Everything a run needs besides its role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoConfig {
    /// Metadata TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// RDMA device; the first one found if unset.
    #[serde(default)]
    pub device: Option<String>,

    #[serde(default = "default_ib_port")]
    pub ib_port: PortNum,

    #[serde(default)]
    pub gid_index: GidIndex,

    /// Size of each buffer half.
    #[serde(default = "default_buf_size")]
    pub buf_size: u32,

    #[serde(default = "default_tx_depth")]
    pub tx_depth: u32,

    #[serde(default = "default_service_level")]
    pub service_level: u8,

    /// Message the server writes.
    #[serde(default = "default_payload")]
    pub payload: String,

    /// Drive the client QP to RTS as well.
    #[serde(default)]
    pub client_rts: bool,

    /// Write with immediate and let the client wait on its receive CQ.
    #[serde(default)]
    pub notify: bool,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Read/write timeout of the metadata socket; blocking if unset.
    #[serde(default)]
    pub exchange_timeout_ms: Option<u64>,

    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            device: None,
            ib_port: default_ib_port(),
            gid_index: 0,
            buf_size: default_buf_size(),
            tx_depth: default_tx_depth(),
            service_level: default_service_level(),
            payload: default_payload(),
            client_rts: false,
            notify: false,
            connect_attempts: default_connect_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            exchange_timeout_ms: None,
            completion_timeout_ms: default_completion_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl EchoConfig {
    /// Parse the `[ibecho]` table out of a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut doc: toml::Table = toml::from_str(s)?;
        let table = doc.remove("ibecho").ok_or(ConfigError::MissingTable)?;
        let config: Self = table.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the `[ibecho]` table of the TOML file at `path`.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Reject values no run can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buf_size == 0 {
            return Err(ConfigError::Invalid("buf_size must be positive".into()));
        }
        if self.tx_depth == 0 {
            return Err(ConfigError::Invalid("tx_depth must be positive".into()));
        }
        if self.payload.len() + 1 > self.buf_size as usize {
            return Err(ConfigError::Invalid(format!(
                "payload of {} bytes plus its terminator does not fit in {} bytes",
                self.payload.len(),
                self.buf_size
            )));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connect_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn endpoint_params(&self) -> EndpointParams {
        EndpointParams {
            device: self.device.clone(),
            ib_port: self.ib_port,
            gid_index: self.gid_index,
            half_size: self.buf_size,
            tx_depth: self.tx_depth,
            service_level: self.service_level,
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            attempts: self.connect_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_ms.map(Duration::from_millis)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_gives_defaults() {
        let config = EchoConfig::from_toml_str("[ibecho]\n").unwrap();
        assert_eq!(config, EchoConfig::default());
        assert_eq!(config.port, 18515);
        assert_eq!(config.payload, "MA KORE MOTEK");
        assert_eq!(config.endpoint_params(), EndpointParams::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = EchoConfig::from_toml_str(
            r#"
            [ibecho]
            port = 20000
            device = "mlx5_1"
            gid_index = 3
            notify = true
            connect_attempts = 5
            exchange_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 20000);
        assert_eq!(config.device.as_deref(), Some("mlx5_1"));
        assert_eq!(config.gid_index, 3);
        assert!(config.notify);
        assert_eq!(config.connect_options().attempts, 5);
        assert_eq!(config.exchange_timeout(), Some(Duration::from_millis(1500)));
        assert!(!config.client_rts);
    }

    #[test]
    fn missing_table_and_unknown_keys_rejected() {
        assert!(matches!(
            EchoConfig::from_toml_str("[other]\nport = 1\n"),
            Err(ConfigError::MissingTable)
        ));
        assert!(matches!(
            EchoConfig::from_toml_str("[ibecho]\nprot = 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation() {
        let ok = EchoConfig::default();
        assert!(ok.validate().is_ok());

        let bad = [
            EchoConfig {
                buf_size: 0,
                ..ok.clone()
            },
            EchoConfig {
                tx_depth: 0,
                ..ok.clone()
            },
            EchoConfig {
                buf_size: 13,
                ..ok.clone()
            },
            EchoConfig {
                connect_attempts: 0,
                ..ok.clone()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{:?}",
                config
            );
        }

        // Exactly fits with the terminator.
        let tight = EchoConfig {
            buf_size: 14,
            ..ok
        };
        assert!(tight.validate().is_ok());
    }
}
