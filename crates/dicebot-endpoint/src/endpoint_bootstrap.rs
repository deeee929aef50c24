//! Prepares a process-backed endpoint's working directory before launch.
//!
//! The protocol client reads `device.json` and `config.yml` from its working
//! directory and writes `qrcode.png` / `session.token` there itself.

use std::path::{Path, PathBuf};

use dicebot_core::{remove_file_if_exists, write_text_atomic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::endpoint_contract::DeviceProtocol;
use crate::endpoint_device_identity::{generate_device_identity, DeviceIdentityError};
use crate::endpoint_port_allocator::{allocate_local_port, local_connect_url};

pub const DEVICE_FILE_NAME: &str = "device.json";
pub const CONFIG_FILE_NAME: &str = "config.yml";
pub const QR_CODE_FILE_NAME: &str = "qrcode.png";
pub const SESSION_TOKEN_FILE_NAME: &str = "session.token";

const CLIENT_LISTEN_HOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
/// Enumerates supported `EndpointBootstrapError` values.
pub enum EndpointBootstrapError {
    #[error("account id '{0}' is not numeric")]
    InvalidAccount(String),
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to allocate local listener port: {0}")]
    PortAllocation(#[source] std::io::Error),
    #[error(transparent)]
    Identity(#[from] DeviceIdentityError),
    #[error("failed to render client config: {0}")]
    RenderConfig(#[from] serde_yaml::Error),
    #[error("failed to persist endpoint file: {0:#}")]
    Persist(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// File locations inside one endpoint's working directory.
pub struct EndpointWorkspace {
    root: PathBuf,
}

impl EndpointWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_file(&self) -> PathBuf {
        self.root.join(DEVICE_FILE_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn qr_code_file(&self) -> PathBuf {
        self.root.join(QR_CODE_FILE_NAME)
    }

    pub fn session_token_file(&self) -> PathBuf {
        self.root.join(SESSION_TOKEN_FILE_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapRequest<'a> {
    pub workspace: &'a EndpointWorkspace,
    pub account_id: &'a str,
    /// Empty selects QR-code login.
    pub password: &'a str,
    pub protocol: DeviceProtocol,
    pub login_succeeded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub stale_qr_code_removed: bool,
    pub purged_files: Vec<PathBuf>,
    pub device_file_created: bool,
    pub config_file_created: bool,
    /// Set when a new config allocated a listener port; the caller records it
    /// on the endpoint.
    pub connect_url: Option<String>,
}

/// Guarantees `device.json` and `config.yml` exist for the next launch.
///
/// When the endpoint never completed a login, existing files are deleted first
/// so a half-finished attempt is never retried with its own artifacts. Not
/// atomic against a concurrent bootstrap of the same directory; the reconnect
/// loop's single-attachment rule prevents that.
pub fn bootstrap_endpoint_files(
    request: &BootstrapRequest<'_>,
) -> Result<BootstrapReport, EndpointBootstrapError> {
    let workspace = request.workspace;
    let uin = parse_account_uin(request.account_id)?;
    std::fs::create_dir_all(workspace.root()).map_err(|source| EndpointBootstrapError::Io {
        path: workspace.root().to_path_buf(),
        source,
    })?;

    let mut report = BootstrapReport {
        stale_qr_code_removed: remove_or_report(&workspace.qr_code_file())?,
        ..BootstrapReport::default()
    };

    if !request.login_succeeded {
        for path in [workspace.config_file(), workspace.device_file()] {
            if remove_or_report(&path)? {
                report.purged_files.push(path);
            }
        }
        if !report.purged_files.is_empty() {
            info!(
                work_dir = %workspace.root().display(),
                purged = report.purged_files.len(),
                "purged artifacts of an unfinished login"
            );
        }
    }

    let device_path = workspace.device_file();
    if device_path.exists() {
        debug!(path = %device_path.display(), "device file present; keeping it");
    } else {
        let identity = generate_device_identity(request.protocol)?;
        write_text_atomic(&device_path, &identity.to_json()?)
            .map_err(EndpointBootstrapError::Persist)?;
        report.device_file_created = true;
    }

    let config_path = workspace.config_file();
    if !config_path.exists() {
        let port = allocate_local_port().map_err(EndpointBootstrapError::PortAllocation)?;
        let rendered = render_client_config(uin, request.password, port)?;
        write_text_atomic(&config_path, &rendered).map_err(EndpointBootstrapError::Persist)?;
        report.config_file_created = true;
        report.connect_url = Some(local_connect_url(port));
    }

    Ok(report)
}

/// Deletes the client's saved session so the next login starts from scratch.
pub fn invalidate_session_token(
    workspace: &EndpointWorkspace,
) -> Result<bool, EndpointBootstrapError> {
    remove_or_report(&workspace.session_token_file())
}

fn remove_or_report(path: &Path) -> Result<bool, EndpointBootstrapError> {
    remove_file_if_exists(path).map_err(EndpointBootstrapError::Persist)
}

fn parse_account_uin(account_id: &str) -> Result<i64, EndpointBootstrapError> {
    account_id
        .trim()
        .parse::<i64>()
        .map_err(|_| EndpointBootstrapError::InvalidAccount(account_id.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Protocol client configuration file, `config.yml`.
pub struct ClientConfig {
    pub account: AccountSection,
    pub heartbeat: HeartbeatSection,
    pub message: MessageSection,
    pub output: OutputSection,
    pub default_middlewares: MiddlewareSection,
    pub database: DatabaseSection,
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccountSection {
    pub uin: i64,
    pub password: String,
    pub encrypt: bool,
    pub status: u8,
    pub relogin: ReloginSection,
    pub use_sso_address: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReloginSection {
    pub delay: u32,
    pub interval: u32,
    /// Zero means unlimited.
    pub max_times: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSection {
    pub interval: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageSection {
    pub post_format: String,
    pub ignore_invalid_cqcode: bool,
    pub force_fragment: bool,
    pub fix_url: bool,
    pub proxy_rewrite: String,
    pub report_self_message: bool,
    pub remove_reply_at: bool,
    pub extra_reply_data: bool,
    pub skip_mime_scan: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputSection {
    pub log_level: String,
    pub log_aging: u32,
    pub log_force_new: bool,
    pub log_colorful: bool,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiddlewareSection {
    pub access_token: String,
    pub filter: String,
    pub rate_limit: RateLimitSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSection {
    pub enabled: bool,
    pub frequency: u32,
    pub bucket: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub leveldb: LevelDbSection,
    pub cache: MediaCacheSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDbSection {
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCacheSection {
    pub image: String,
    pub video: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub ws: WebsocketServerSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketServerSection {
    pub host: String,
    pub port: u16,
    pub middlewares: MiddlewareSection,
}

impl ClientConfig {
    /// Forward-websocket listener on `127.0.0.1:port` for the given account.
    pub fn for_account(uin: i64, password: &str, port: u16) -> Self {
        let middlewares = MiddlewareSection {
            access_token: String::new(),
            filter: String::new(),
            rate_limit: RateLimitSection {
                enabled: false,
                frequency: 1,
                bucket: 1,
            },
        };
        Self {
            account: AccountSection {
                uin,
                password: password.to_string(),
                encrypt: false,
                status: 0,
                relogin: ReloginSection {
                    delay: 3,
                    interval: 3,
                    max_times: 0,
                },
                use_sso_address: true,
            },
            heartbeat: HeartbeatSection { interval: 5 },
            message: MessageSection {
                post_format: "string".to_string(),
                ignore_invalid_cqcode: false,
                force_fragment: false,
                fix_url: false,
                proxy_rewrite: String::new(),
                report_self_message: false,
                remove_reply_at: false,
                extra_reply_data: false,
                skip_mime_scan: false,
            },
            output: OutputSection {
                log_level: "warn".to_string(),
                log_aging: 15,
                log_force_new: true,
                log_colorful: true,
                debug: false,
            },
            default_middlewares: middlewares.clone(),
            database: DatabaseSection {
                leveldb: LevelDbSection { enable: true },
                cache: MediaCacheSection {
                    image: "data/image.db".to_string(),
                    video: "data/video.db".to_string(),
                },
            },
            servers: vec![ServerEntry {
                ws: WebsocketServerSection {
                    host: CLIENT_LISTEN_HOST.to_string(),
                    port,
                    middlewares,
                },
            }],
        }
    }

    pub fn websocket_port(&self) -> Option<u16> {
        self.servers.first().map(|entry| entry.ws.port)
    }
}

pub fn render_client_config(
    uin: i64,
    password: &str,
    port: u16,
) -> Result<String, EndpointBootstrapError> {
    Ok(serde_yaml::to_string(&ClientConfig::for_account(
        uin, password, port,
    ))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request<'a>(workspace: &'a EndpointWorkspace, login_succeeded: bool) -> BootstrapRequest<'a> {
        BootstrapRequest {
            workspace,
            account_id: "123456789",
            password: "",
            protocol: DeviceProtocol::Pad,
            login_succeeded,
        }
    }

    fn seed_stale_files(workspace: &EndpointWorkspace) {
        std::fs::create_dir_all(workspace.root()).expect("mkdir");
        std::fs::write(workspace.device_file(), "stale-device").expect("device");
        std::fs::write(workspace.config_file(), "stale-config").expect("config");
    }

    #[test]
    fn functional_fresh_workspace_gets_identity_and_config() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path().join("extra/go-cqhttp-qq123456789"));

        let report = bootstrap_endpoint_files(&request(&workspace, false)).expect("bootstrap");

        assert!(report.purged_files.is_empty());
        assert!(report.device_file_created);
        assert!(report.config_file_created);
        let raw = std::fs::read_to_string(workspace.config_file()).expect("config");
        let config: ClientConfig = serde_yaml::from_str(&raw).expect("parse config");
        assert_eq!(config.account.uin, 123456789);
        let port = config.websocket_port().expect("port");
        assert_eq!(report.connect_url, Some(format!("ws://localhost:{port}")));
        let device: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(workspace.device_file()).expect("read"))
                .expect("device json");
        assert_eq!(device["protocol"], 0);
    }

    #[test]
    fn functional_unfinished_login_purges_and_regenerates_files() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path());
        seed_stale_files(&workspace);

        let report = bootstrap_endpoint_files(&request(&workspace, false)).expect("bootstrap");

        assert_eq!(report.purged_files.len(), 2);
        assert!(report.device_file_created);
        assert!(report.config_file_created);
        assert_ne!(
            std::fs::read_to_string(workspace.device_file()).expect("device"),
            "stale-device"
        );
        assert_ne!(
            std::fs::read_to_string(workspace.config_file()).expect("config"),
            "stale-config"
        );
    }

    #[test]
    fn functional_successful_login_keeps_existing_files() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path());
        seed_stale_files(&workspace);

        let report = bootstrap_endpoint_files(&request(&workspace, true)).expect("bootstrap");

        assert!(report.purged_files.is_empty());
        assert!(!report.device_file_created);
        assert!(!report.config_file_created);
        assert!(report.connect_url.is_none());
        assert_eq!(
            std::fs::read_to_string(workspace.device_file()).expect("device"),
            "stale-device"
        );
        assert_eq!(
            std::fs::read_to_string(workspace.config_file()).expect("config"),
            "stale-config"
        );
    }

    #[test]
    fn regression_leftover_qr_code_is_removed_before_launch() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path());
        std::fs::write(workspace.qr_code_file(), [0x89, b'P', b'N', b'G']).expect("qr");

        let report = bootstrap_endpoint_files(&request(&workspace, true)).expect("bootstrap");

        assert!(report.stale_qr_code_removed);
        assert!(!workspace.qr_code_file().exists());
    }

    #[test]
    fn unit_non_numeric_account_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path());
        let mut bad = request(&workspace, false);
        bad.account_id = "not-a-number";
        let error = bootstrap_endpoint_files(&bad).expect_err("invalid account");
        assert!(matches!(error, EndpointBootstrapError::InvalidAccount(_)));
        assert!(!workspace.device_file().exists());
    }

    #[test]
    fn unit_rendered_config_quotes_password_and_disables_rate_limit() {
        let rendered = render_client_config(42, "p: w'd", 6700).expect("render");
        let parsed: ClientConfig = serde_yaml::from_str(&rendered).expect("parse");
        assert_eq!(parsed.account.password, "p: w'd");
        assert_eq!(parsed.output.log_level, "warn");
        assert!(!parsed.default_middlewares.rate_limit.enabled);
        assert_eq!(parsed.servers[0].ws.host, "127.0.0.1");
        assert!(rendered.contains("use-sso-address: true"));
    }

    #[test]
    fn functional_invalidate_session_token_reports_removal() {
        let temp = tempdir().expect("tempdir");
        let workspace = EndpointWorkspace::new(temp.path());
        assert!(!invalidate_session_token(&workspace).expect("missing token"));
        std::fs::write(workspace.session_token_file(), "token").expect("token");
        assert!(invalidate_session_token(&workspace).expect("remove token"));
        assert!(!workspace.session_token_file().exists());
    }
}
