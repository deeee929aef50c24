//! TOML configuration for the gateway binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dicebot_endpoint::{
    DeviceProtocol, EndpointGatewayConfig, ReconnectPolicy, SubprocessLaunchConfig,
    ENDPOINT_REGISTRY_FILE_NAME,
};
use serde::Deserialize;

const DEFAULT_DATA_DIR: &str = "data/default";
const DEFAULT_RECONNECT_BACKOFF_SECONDS: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct GatewayConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) protocol_client: ProtocolClientConfig,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) device: DeviceConfig,
    pub(crate) session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            protocol_client: ProtocolClientConfig::default(),
            reconnect: ReconnectConfig::default(),
            device: DeviceConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ProtocolClientConfig {
    pub(crate) program: PathBuf,
    pub(crate) args: Vec<String>,
}

impl Default for ProtocolClientConfig {
    fn default() -> Self {
        let launch = SubprocessLaunchConfig::default();
        Self {
            program: launch.program,
            args: launch.args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ReconnectConfig {
    pub(crate) backoff_seconds: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: DEFAULT_RECONNECT_BACKOFF_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DeviceConfig {
    pub(crate) protocol: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            protocol: DeviceProtocol::default().as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SessionConfig {
    pub(crate) connect_timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: DEFAULT_CONNECT_TIMEOUT_SECONDS,
        }
    }
}

impl GatewayConfig {
    /// Reads `path` when given; otherwise every default applies.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn with_data_dir_override(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(data_dir) = data_dir {
            self.data_dir = data_dir;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir must be non-empty");
        }
        if self.protocol_client.program.as_os_str().is_empty() {
            bail!("protocol_client.program must be non-empty");
        }
        if self.reconnect.backoff_seconds == 0 {
            bail!("reconnect.backoff_seconds must be greater than 0");
        }
        if self.session.connect_timeout_seconds == 0 {
            bail!("session.connect_timeout_seconds must be greater than 0");
        }
        self.device_protocol()?;
        Ok(())
    }

    pub(crate) fn device_protocol(&self) -> Result<DeviceProtocol> {
        DeviceProtocol::parse(&self.device.protocol).with_context(|| {
            format!(
                "unsupported device.protocol '{}' (expected pad, android or watch)",
                self.device.protocol
            )
        })
    }

    pub(crate) fn registry_path(&self) -> PathBuf {
        self.data_dir.join(ENDPOINT_REGISTRY_FILE_NAME)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_seconds)
    }

    pub(crate) fn endpoint_gateway_config(&self) -> Result<EndpointGatewayConfig> {
        Ok(EndpointGatewayConfig {
            data_dir: self.data_dir.clone(),
            launch: SubprocessLaunchConfig {
                program: self.protocol_client.program.clone(),
                args: self.protocol_client.args.clone(),
                ..SubprocessLaunchConfig::default()
            },
            reconnect: ReconnectPolicy::from_seconds(self.reconnect.backoff_seconds),
            device_protocol: self.device_protocol()?,
        })
    }
}
