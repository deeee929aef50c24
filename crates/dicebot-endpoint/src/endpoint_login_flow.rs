//! Login flow driven by the protocol client's log output.
//!
//! [`decode_login_line`] is a pure decoder over an ordered rule table; the
//! first matching rule wins. [`LoginSession`] applies decoded events to the
//! endpoint record, one line at a time, in arrival order.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::endpoint_contract::EndpointLifecycleState;
use crate::endpoint_state::EndpointRecord;

pub const QR_CODE_MARKER: &str = "qrcode.png";
pub const TRANSPORT_LIVE_MARKER: &str = "CQ WebSocket 服务器已启动";
pub const DEVICE_LOCK_MARKER: &str = "账号已开启设备锁，请前往";
pub const SCAN_TO_CONTINUE_MARKER: &str = "请使用手机QQ扫描二维码以继续登录";
pub const RISK_CONTROL_MARKER: &str = "风控";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `DiagnosticSeverity` values.
pub enum DiagnosticSeverity {
    RiskControl,
    Warning,
    Error,
    Fatal,
}

impl DiagnosticSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RiskControl => "risk_control",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Most severe marker present in `line`.
    pub fn detect(line: &str) -> Option<Self> {
        if line.contains("FATAL") {
            Some(Self::Fatal)
        } else if line.contains("ERROR") {
            Some(Self::Error)
        } else if line.contains(RISK_CONTROL_MARKER) {
            Some(Self::RiskControl)
        } else if line.contains("WARNING") {
            Some(Self::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Discrete lifecycle events decoded from one output line.
pub enum LoginLineEvent {
    QrCodeWritten,
    TransportLive,
    DeviceLockRedirect { url: String },
    ScanToContinue,
    Diagnostic(DiagnosticSeverity),
}

struct LoginLineRule {
    name: &'static str,
    decode: fn(&str) -> Option<LoginLineEvent>,
}

const LOGIN_LINE_RULES: &[LoginLineRule] = &[
    LoginLineRule {
        name: "qr_code_written",
        decode: decode_qr_code_written,
    },
    LoginLineRule {
        name: "transport_live",
        decode: decode_transport_live,
    },
    LoginLineRule {
        name: "device_lock_redirect",
        decode: decode_device_lock_redirect,
    },
    LoginLineRule {
        name: "scan_to_continue",
        decode: decode_scan_to_continue,
    },
    LoginLineRule {
        name: "diagnostic",
        decode: decode_diagnostic,
    },
];

fn decode_qr_code_written(line: &str) -> Option<LoginLineEvent> {
    line.contains(QR_CODE_MARKER)
        .then_some(LoginLineEvent::QrCodeWritten)
}

fn decode_transport_live(line: &str) -> Option<LoginLineEvent> {
    line.contains(TRANSPORT_LIVE_MARKER)
        .then_some(LoginLineEvent::TransportLive)
}

fn decode_device_lock_redirect(line: &str) -> Option<LoginLineEvent> {
    if !line.contains(DEVICE_LOCK_MARKER) {
        return None;
    }
    extract_device_lock_url(line).map(|url| LoginLineEvent::DeviceLockRedirect { url })
}

fn decode_scan_to_continue(line: &str) -> Option<LoginLineEvent> {
    line.contains(SCAN_TO_CONTINUE_MARKER)
        .then_some(LoginLineEvent::ScanToContinue)
}

fn decode_diagnostic(line: &str) -> Option<LoginLineEvent> {
    DiagnosticSeverity::detect(line).map(LoginLineEvent::Diagnostic)
}

/// Names of the decoder rules in priority order.
pub fn login_line_rule_names() -> Vec<&'static str> {
    LOGIN_LINE_RULES.iter().map(|rule| rule.name).collect()
}

/// Maps one (already ANSI-stripped) line to at most one event.
pub fn decode_login_line(line: &str) -> Option<LoginLineEvent> {
    LOGIN_LINE_RULES.iter().find_map(|rule| (rule.decode)(line))
}

fn extract_device_lock_url(line: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"-> (.+?) <-").ok())
        .as_ref()?;
    pattern
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|url| url.as_str().trim().to_string())
}

/// Removes terminal colour and cursor escape sequences.
pub fn strip_ansi(line: &str) -> String {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    match PATTERN
        .get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").ok())
        .as_ref()
    {
        Some(pattern) => pattern.replace_all(line, "").into_owned(),
        None => line.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Log level an output line is surfaced at.
pub enum LineVisibility {
    /// Pre-login noise.
    #[default]
    Trace,
    Debug,
    Warn,
}

impl LineVisibility {
    pub fn classify(line: &str, logged_in: bool) -> Self {
        if DiagnosticSeverity::detect(line).is_some() {
            Self::Warn
        } else if logged_in {
            Self::Debug
        } else {
            Self::Trace
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Outcome of applying one line.
pub struct LoginStep {
    pub line: String,
    pub event: Option<LoginLineEvent>,
    pub visibility: LineVisibility,
    /// True exactly once per session: start the message-session layer now.
    pub hand_off: bool,
    /// The durable login marker changed; the registry should be persisted.
    pub login_succeeded_changed: bool,
}

/// A decoded output line plus the QR image read for it, if any.
#[derive(Debug)]
pub struct PreparedLoginLine {
    line: String,
    event: Option<LoginLineEvent>,
    qr_image: Option<std::io::Result<Vec<u8>>>,
}

#[derive(Debug)]
/// Login state machine for one connection attempt.
pub struct LoginSession {
    state: EndpointLifecycleState,
    qr_code_path: PathBuf,
    qr_code: Option<Vec<u8>>,
    device_lock_url: Option<String>,
    qr_ready_tx: Option<oneshot::Sender<Vec<u8>>>,
    handed_off: bool,
}

impl LoginSession {
    /// Returns the session and the single-use receiver that yields the QR image
    /// bytes the first time they become available.
    pub fn new(qr_code_path: PathBuf) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (qr_ready_tx, qr_ready_rx) = oneshot::channel();
        (
            Self {
                state: EndpointLifecycleState::Idle,
                qr_code_path,
                qr_code: None,
                device_lock_url: None,
                qr_ready_tx: Some(qr_ready_tx),
                handed_off: false,
            },
            qr_ready_rx,
        )
    }

    pub fn state(&self) -> EndpointLifecycleState {
        self.state
    }

    pub fn qr_code(&self) -> Option<&[u8]> {
        self.qr_code.as_deref()
    }

    pub fn device_lock_url(&self) -> Option<&str> {
        self.device_lock_url.as_deref()
    }

    pub fn handed_off(&self) -> bool {
        self.handed_off
    }

    /// Applies one raw output line to the session and the endpoint record.
    pub fn apply_line(&mut self, raw_line: &str, record: &mut EndpointRecord) -> LoginStep {
        let prepared = self.prepare_line(raw_line);
        self.apply_prepared(prepared, record)
    }

    /// Decodes a raw line and does its file I/O, so that `apply_prepared` can
    /// run under the endpoint lock without touching the disk.
    pub fn prepare_line(&self, raw_line: &str) -> PreparedLoginLine {
        let line = strip_ansi(raw_line);
        let event = decode_login_line(&line);
        let qr_image = match event {
            Some(LoginLineEvent::QrCodeWritten) if self.qr_ready_tx.is_some() => {
                Some(std::fs::read(&self.qr_code_path))
            }
            _ => None,
        };
        PreparedLoginLine {
            line,
            event,
            qr_image,
        }
    }

    pub fn apply_prepared(
        &mut self,
        prepared: PreparedLoginLine,
        record: &mut EndpointRecord,
    ) -> LoginStep {
        let PreparedLoginLine {
            line,
            event,
            qr_image,
        } = prepared;
        let mut step = LoginStep {
            visibility: LineVisibility::classify(&line, record.runtime.login_success),
            event: event.clone(),
            ..LoginStep::default()
        };

        match event {
            Some(LoginLineEvent::QrCodeWritten) => {
                if let Some(image) = qr_image {
                    self.on_qr_code_written(image, record);
                }
            }
            Some(LoginLineEvent::TransportLive) => {
                if !self.handed_off {
                    step.login_succeeded_changed = !record.profile.login_succeeded;
                    self.transition(record, EndpointLifecycleState::LoggedIn);
                    record.runtime.login_success = true;
                    record.profile.login_succeeded = true;
                    record.profile.enabled = true;
                    record.runtime.awaiting_scan = false;
                    info!(
                        endpoint_id = %record.profile.id,
                        account = %record.profile.account_id,
                        "protocol client logged in"
                    );
                    self.handed_off = true;
                    step.hand_off = true;
                    self.transition(record, EndpointLifecycleState::Serving);
                }
            }
            Some(LoginLineEvent::DeviceLockRedirect { ref url }) => {
                step.login_succeeded_changed = !record.profile.login_succeeded;
                record.profile.login_succeeded = true;
                record.runtime.device_lock_url = Some(url.clone());
                self.device_lock_url = Some(url.clone());
                if !self.state.is_logged_in() {
                    self.transition(record, EndpointLifecycleState::DeviceLockPending);
                }
                info!(
                    endpoint_id = %record.profile.id,
                    url = %url,
                    "device lock verification required"
                );
            }
            Some(LoginLineEvent::ScanToContinue) => {
                record.runtime.awaiting_scan = true;
                if self.state == EndpointLifecycleState::Idle {
                    self.transition(record, EndpointLifecycleState::AwaitingQrCode);
                }
            }
            Some(LoginLineEvent::Diagnostic(_)) | None => {}
        }

        step.line = line;
        step
    }

    /// Marks the session finished. Reachable from any state.
    pub fn terminate(&mut self, record: &mut EndpointRecord) {
        self.transition(record, EndpointLifecycleState::Terminated);
    }

    fn on_qr_code_written(
        &mut self,
        image: std::io::Result<Vec<u8>>,
        record: &mut EndpointRecord,
    ) {
        let bytes = match image {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(
                    endpoint_id = %record.profile.id,
                    path = %self.qr_code_path.display(),
                    error = %error,
                    "qr code marker seen but image is unreadable"
                );
                return;
            }
        };
        self.qr_code = Some(bytes.clone());
        record.runtime.qr_code = Some(bytes.clone());
        // A late marker after login keeps the image but never rewinds the state.
        if self.state.is_logged_in() {
            return;
        }
        record.runtime.qr_code_ready = true;
        self.transition(record, EndpointLifecycleState::QrCodeReady);
        if let Some(sender) = self.qr_ready_tx.take() {
            let _ = sender.send(bytes);
        }
    }

    fn transition(&mut self, record: &mut EndpointRecord, next: EndpointLifecycleState) {
        self.state = next;
        record.runtime.state = next;
    }
}
