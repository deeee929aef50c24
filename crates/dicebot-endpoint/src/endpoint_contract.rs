//! Shared vocabulary for endpoint supervision: connection kinds, lifecycle
//! states, device protocol selectors and serve outcomes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `EndpointConnectionKind` values.
pub enum EndpointConnectionKind {
    /// Transport provided by a protocol client process this gateway launches.
    #[default]
    ManagedSubprocess,
    /// Transport reached directly at `connect_url`; nothing is spawned.
    ExternalTransport,
}

impl EndpointConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManagedSubprocess => "managed_subprocess",
            Self::ExternalTransport => "external_transport",
        }
    }

    pub fn is_managed(self) -> bool {
        matches!(self, Self::ManagedSubprocess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Login lifecycle of one endpoint. Variants are ordered by login progress.
pub enum EndpointLifecycleState {
    #[default]
    Idle,
    AwaitingQrCode,
    QrCodeReady,
    DeviceLockPending,
    LoggedIn,
    Serving,
    Terminated,
}

impl EndpointLifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingQrCode => "awaiting_qr_code",
            Self::QrCodeReady => "qr_code_ready",
            Self::DeviceLockPending => "device_lock_pending",
            Self::LoggedIn => "logged_in",
            Self::Serving => "serving",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_logged_in(self) -> bool {
        matches!(self, Self::LoggedIn | Self::Serving)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
/// Client class the protocol process impersonates. Serialized as the numeric
/// selector the protocol client reads from its device file.
pub enum DeviceProtocol {
    #[default]
    Pad,
    AndroidPhone,
    Watch,
}

impl DeviceProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pad => "pad",
            Self::AndroidPhone => "android",
            Self::Watch => "watch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pad" | "tablet" | "0" => Some(Self::Pad),
            "android" | "phone" | "1" => Some(Self::AndroidPhone),
            "watch" | "2" => Some(Self::Watch),
            _ => None,
        }
    }
}

impl From<DeviceProtocol> for u8 {
    fn from(value: DeviceProtocol) -> Self {
        match value {
            DeviceProtocol::Pad => 0,
            DeviceProtocol::AndroidPhone => 1,
            DeviceProtocol::Watch => 2,
        }
    }
}

impl TryFrom<u8> for DeviceProtocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::AndroidPhone),
            2 => Ok(Self::Watch),
            other => Err(format!("unsupported device protocol selector {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of one connection attempt as seen by the reconnect loop.
pub enum ServeOutcome {
    /// Intentional stop. The reconnect loop must not retry.
    Terminal,
    /// Connection lost or never established; retry after backoff.
    Transient { code: i32 },
}

impl ServeOutcome {
    /// Maps a message-session status code: zero is terminal, anything else transient.
    pub fn from_status_code(code: i32) -> Self {
        if code == 0 {
            Self::Terminal
        } else {
            Self::Transient { code }
        }
    }

    pub fn status_code(self) -> i32 {
        match self {
            Self::Terminal => 0,
            Self::Transient { code } => code,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal)
    }
}
