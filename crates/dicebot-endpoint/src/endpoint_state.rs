//! Endpoint records and the shared handle every supervisor component uses.
//!
//! All flags of one endpoint live in a single record behind one mutex, so
//! related flags (for example the three login-success markers) always change
//! together. Endpoints are referenced by stable id through [`EndpointHandle`],
//! never by position in a list.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use dicebot_core::{current_unix_timestamp_ms, elapsed_since_unix_ms};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::endpoint_contract::{DeviceProtocol, EndpointConnectionKind, EndpointLifecycleState};

const MANAGED_WORK_DIR_PREFIX: &str = "extra/go-cqhttp-qq";
const MANAGED_PLATFORM: &str = "QQ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Durable part of an endpoint, persisted by the registry.
pub struct EndpointProfile {
    pub id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub connection_kind: EndpointConnectionKind,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub connect_url: Option<String>,
    /// Survives restarts; distinguishes "never logged in" from "was logged in".
    #[serde(default)]
    pub login_succeeded: bool,
    #[serde(default)]
    pub device_protocol: DeviceProtocol,
}

impl EndpointProfile {
    /// A new process-backed endpoint. Starts disabled.
    pub fn new_managed(account_id: &str, display_name: &str, protocol: DeviceProtocol) -> Self {
        let account_id = account_id.trim().to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: MANAGED_PLATFORM.to_string(),
            connection_kind: EndpointConnectionKind::ManagedSubprocess,
            enabled: false,
            display_name: display_name.trim().to_string(),
            work_dir: PathBuf::from(format!("{MANAGED_WORK_DIR_PREFIX}{account_id}")),
            account_id,
            connect_url: None,
            login_succeeded: false,
            device_protocol: protocol,
        }
    }

    /// A new endpoint served by an already-running transport at `connect_url`.
    pub fn new_transport(platform: &str, connect_url: &str, display_name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.trim().to_string(),
            connection_kind: EndpointConnectionKind::ExternalTransport,
            enabled: false,
            display_name: display_name.trim().to_string(),
            account_id: String::new(),
            work_dir: PathBuf::new(),
            connect_url: Some(connect_url.trim().to_string()),
            login_succeeded: false,
            device_protocol: DeviceProtocol::default(),
        }
    }

    pub fn resolve_work_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.work_dir)
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
/// Account password held in memory only; never persisted or logged.
pub struct AccountPassword(String);

impl AccountPassword {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccountPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountPassword(<redacted>)")
    }
}

#[derive(Debug, Clone, Default)]
/// Transient part of an endpoint, rebuilt on every gateway start.
pub struct EndpointRuntime {
    pub state: EndpointLifecycleState,
    /// A supervisory loop should keep this endpoint connected.
    pub serving: bool,
    /// A reconnect loop task currently owns this endpoint.
    pub loop_attached: bool,
    pub login_success: bool,
    pub qr_code_ready: bool,
    pub qr_code: Option<Vec<u8>>,
    pub awaiting_scan: bool,
    pub device_lock_url: Option<String>,
    pub process_running: bool,
    pub process_pid: Option<u32>,
    pub process_started_unix_ms: Option<u64>,
    pub last_exit: Option<String>,
    pub password: Option<AccountPassword>,
}

impl EndpointRuntime {
    /// Resets everything tied to one login attempt.
    pub fn clear_login_flags(&mut self) {
        self.login_success = false;
        self.qr_code_ready = false;
        self.qr_code = None;
        self.awaiting_scan = false;
        self.device_lock_url = None;
        self.process_running = false;
        self.process_pid = None;
        self.process_started_unix_ms = None;
    }
}

#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub profile: EndpointProfile,
    pub runtime: EndpointRuntime,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Operator-facing view of one endpoint.
pub struct EndpointStatusReport {
    pub id: String,
    pub platform: String,
    pub connection_kind: String,
    pub display_name: String,
    pub account_id: String,
    pub enabled: bool,
    pub serving: bool,
    pub loop_attached: bool,
    pub state: String,
    pub login_succeeded: bool,
    pub login_success: bool,
    pub qr_code_ready: bool,
    pub awaiting_scan: bool,
    pub device_lock_url: Option<String>,
    pub connect_url: Option<String>,
    pub process_running: bool,
    pub process_pid: Option<u32>,
    pub process_uptime_ms: Option<u64>,
    pub last_exit: Option<String>,
}

#[derive(Debug)]
struct EndpointShared {
    id: String,
    record: Mutex<EndpointRecord>,
    stop_tx: watch::Sender<u64>,
}

#[derive(Debug, Clone)]
/// Cheap, clonable reference to one endpoint's state.
pub struct EndpointHandle {
    shared: Arc<EndpointShared>,
}

impl EndpointHandle {
    pub fn new(profile: EndpointProfile) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(0_u64);
        Self {
            shared: Arc::new(EndpointShared {
                id: profile.id.clone(),
                record: Mutex::new(EndpointRecord {
                    profile,
                    runtime: EndpointRuntime::default(),
                }),
                stop_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.shared.id.as_str()
    }

    pub fn same_endpoint(&self, other: &EndpointHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn read<R>(&self, read: impl FnOnce(&EndpointRecord) -> R) -> R {
        read(&lock_or_recover(&self.shared.record))
    }

    pub fn update<R>(&self, mutate: impl FnOnce(&mut EndpointRecord) -> R) -> R {
        mutate(&mut lock_or_recover(&self.shared.record))
    }

    pub fn profile(&self) -> EndpointProfile {
        self.read(|record| record.profile.clone())
    }

    pub fn state(&self) -> EndpointLifecycleState {
        self.read(|record| record.runtime.state)
    }

    pub fn is_enabled(&self) -> bool {
        self.read(|record| record.profile.enabled)
    }

    pub fn is_serving(&self) -> bool {
        self.read(|record| record.runtime.serving)
    }

    pub fn set_password(&self, password: Option<AccountPassword>) {
        self.update(|record| record.runtime.password = password);
    }

    /// Marks the endpoint as wanted-serving. Returns `true` only when no loop is
    /// attached yet and the caller is now responsible for running one.
    pub fn attach_loop(&self) -> bool {
        self.update(|record| {
            record.runtime.serving = true;
            if record.runtime.loop_attached {
                return false;
            }
            record.runtime.loop_attached = true;
            true
        })
    }

    /// Detaches the loop only if nobody re-enabled serving meanwhile.
    pub fn detach_loop_if_not_serving(&self) -> bool {
        self.update(|record| {
            if record.runtime.serving {
                return false;
            }
            record.runtime.loop_attached = false;
            true
        })
    }

    /// Unconditional detach used for terminal outcomes and panic cleanup.
    pub fn detach_loop(&self) {
        self.update(|record| {
            record.runtime.serving = false;
            record.runtime.loop_attached = false;
        });
    }

    pub fn loop_attached(&self) -> bool {
        self.read(|record| record.runtime.loop_attached)
    }

    /// Clears `serving` and wakes every running attempt and backoff sleep.
    pub fn request_stop(&self) {
        self.update(|record| record.runtime.serving = false);
        self.shared
            .stop_tx
            .send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Subscribes to stop requests issued after this call.
    pub fn subscribe_stop(&self) -> EndpointStopSignal {
        EndpointStopSignal {
            rx: self.shared.stop_tx.subscribe(),
        }
    }

    pub fn clear_login_flags(&self) {
        self.update(|record| record.runtime.clear_login_flags());
    }

    pub fn qr_code(&self) -> Option<Vec<u8>> {
        self.read(|record| {
            record
                .runtime
                .qr_code_ready
                .then(|| record.runtime.qr_code.clone())
                .flatten()
        })
    }

    pub fn mark_process_started(&self, pid: Option<u32>) {
        self.update(|record| {
            record.runtime.process_running = true;
            record.runtime.process_pid = pid;
            record.runtime.process_started_unix_ms = Some(current_unix_timestamp_ms());
        });
    }

    pub fn status_report(&self) -> EndpointStatusReport {
        self.read(|record| {
            let profile = &record.profile;
            let runtime = &record.runtime;
            EndpointStatusReport {
                id: profile.id.clone(),
                platform: profile.platform.clone(),
                connection_kind: profile.connection_kind.as_str().to_string(),
                display_name: profile.display_name.clone(),
                account_id: profile.account_id.clone(),
                enabled: profile.enabled,
                serving: runtime.serving,
                loop_attached: runtime.loop_attached,
                state: runtime.state.as_str().to_string(),
                login_succeeded: profile.login_succeeded,
                login_success: runtime.login_success,
                qr_code_ready: runtime.qr_code_ready,
                awaiting_scan: runtime.awaiting_scan,
                device_lock_url: runtime.device_lock_url.clone(),
                connect_url: profile.connect_url.clone(),
                process_running: runtime.process_running,
                process_pid: runtime.process_pid,
                process_uptime_ms: runtime.process_started_unix_ms.map(|started| {
                    u64::try_from(elapsed_since_unix_ms(started).as_millis()).unwrap_or(u64::MAX)
                }),
                last_exit: runtime.last_exit.clone(),
            }
        })
    }
}

#[derive(Debug)]
/// Receiver side of an endpoint's stop requests.
pub struct EndpointStopSignal {
    rx: watch::Receiver<u64>,
}

impl EndpointStopSignal {
    /// Resolves on the next stop request.
    pub async fn stopped(&mut self) {
        let _ = self.rx.changed().await;
    }

    /// Returns whether a stop request arrived since the last check, and marks it seen.
    pub fn take_fired(&mut self) -> bool {
        let fired = self.rx.has_changed().unwrap_or(true);
        self.rx.borrow_and_update();
        fired
    }
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
