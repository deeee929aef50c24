//! One connection attempt per endpoint kind, as driven by the reconnect loop.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::endpoint_bootstrap::{bootstrap_endpoint_files, BootstrapRequest, EndpointWorkspace};
use crate::endpoint_contract::{EndpointLifecycleState, ServeOutcome};
use crate::endpoint_login_flow::{LineVisibility, LoginSession, LoginStep};
use crate::endpoint_session::EndpointSessionLayer;
use crate::endpoint_state::EndpointHandle;
use crate::endpoint_supervisor::{
    record_termination, spawn_managed_process, stop_endpoint_process, OutputLine,
    SubprocessLaunchConfig,
};

/// The protocol client exited or closed its output.
pub const ATTEMPT_CODE_PROCESS_EXITED: i32 = -1;
pub const ATTEMPT_CODE_BOOTSTRAP_FAILED: i32 = -2;
pub const ATTEMPT_CODE_SPAWN_FAILED: i32 = -3;
/// The message-session task panicked or was cancelled.
pub const ATTEMPT_CODE_SESSION_ABORTED: i32 = -4;

/// Called after an attempt changes an endpoint's durable profile.
pub type ProfileChangeListener = Arc<dyn Fn(&EndpointHandle) + Send + Sync>;

#[async_trait]
/// Trait contract for `ConnectionAttempt` behavior.
pub trait ConnectionAttempt: Send + Sync {
    /// Establishes the connection and blocks while it is up.
    async fn attempt(&self, endpoint: &EndpointHandle) -> ServeOutcome;
}

/// Endpoints whose transport already runs elsewhere: serve directly.
pub struct TransportAttempt {
    session: Arc<dyn EndpointSessionLayer>,
}

impl TransportAttempt {
    pub fn new(session: Arc<dyn EndpointSessionLayer>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ConnectionAttempt for TransportAttempt {
    async fn attempt(&self, endpoint: &EndpointHandle) -> ServeOutcome {
        let mut stop = endpoint.subscribe_stop();
        if !endpoint.is_serving() {
            return ServeOutcome::Terminal;
        }
        endpoint.update(|record| {
            record.runtime.state = EndpointLifecycleState::Serving;
            record.runtime.login_success = true;
        });
        let outcome = tokio::select! {
            outcome = self.session.serve(endpoint) => outcome,
            _ = stop.stopped() => ServeOutcome::Terminal,
        };
        endpoint.update(|record| {
            record.runtime.state = EndpointLifecycleState::Terminated;
            record.runtime.login_success = false;
        });
        outcome
    }
}

/// Endpoints backed by a protocol client process this gateway launches.
pub struct ManagedSubprocessAttempt {
    data_dir: PathBuf,
    launch: SubprocessLaunchConfig,
    session: Arc<dyn EndpointSessionLayer>,
    on_profile_change: Option<ProfileChangeListener>,
}

enum AttemptEvent {
    Line(Option<OutputLine>),
    Served(ServeOutcome),
    StopRequested,
}

impl ManagedSubprocessAttempt {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        launch: SubprocessLaunchConfig,
        session: Arc<dyn EndpointSessionLayer>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            launch,
            session,
            on_profile_change: None,
        }
    }

    pub fn with_profile_listener(mut self, listener: ProfileChangeListener) -> Self {
        self.on_profile_change = Some(listener);
        self
    }

    fn notify_profile_changed(&self, endpoint: &EndpointHandle) {
        if let Some(listener) = &self.on_profile_change {
            listener(endpoint);
        }
    }

    fn fail_before_launch(&self, endpoint: &EndpointHandle, reason: String, code: i32) -> ServeOutcome {
        warn!(endpoint_id = %endpoint.id(), reason = %reason, "endpoint launch failed");
        endpoint.update(|record| {
            record.runtime.state = EndpointLifecycleState::Terminated;
            record.runtime.last_exit = Some(reason);
        });
        ServeOutcome::Transient { code }
    }
}

#[async_trait]
impl ConnectionAttempt for ManagedSubprocessAttempt {
    async fn attempt(&self, endpoint: &EndpointHandle) -> ServeOutcome {
        let mut stop = endpoint.subscribe_stop();
        if !endpoint.is_serving() {
            return ServeOutcome::Terminal;
        }

        let profile = endpoint.profile();
        let workspace = EndpointWorkspace::new(profile.resolve_work_dir(&self.data_dir));
        let password = endpoint
            .read(|record| record.runtime.password.clone())
            .unwrap_or_default();
        endpoint.update(|record| {
            record.runtime.clear_login_flags();
            record.runtime.state = EndpointLifecycleState::Idle;
        });

        let report = match bootstrap_endpoint_files(&BootstrapRequest {
            workspace: &workspace,
            account_id: &profile.account_id,
            password: password.expose(),
            protocol: profile.device_protocol,
            login_succeeded: profile.login_succeeded,
        }) {
            Ok(report) => report,
            Err(error) => {
                return self.fail_before_launch(
                    endpoint,
                    format!("bootstrap failed: {error}"),
                    ATTEMPT_CODE_BOOTSTRAP_FAILED,
                )
            }
        };
        if let Some(connect_url) = report.connect_url {
            endpoint.update(|record| record.profile.connect_url = Some(connect_url));
            self.notify_profile_changed(endpoint);
        }

        let mut process = match spawn_managed_process(&self.launch, workspace.root()) {
            Ok(process) => process,
            Err(error) => {
                return self.fail_before_launch(
                    endpoint,
                    format!("spawn failed: {error}"),
                    ATTEMPT_CODE_SPAWN_FAILED,
                )
            }
        };
        endpoint.mark_process_started(process.pid());

        let (mut login, qr_ready) = LoginSession::new(workspace.qr_code_file());
        spawn_qr_code_announcer(endpoint.clone(), qr_ready);
        let mut serving: Option<JoinHandle<ServeOutcome>> = None;

        loop {
            let event = tokio::select! {
                line = process.next_line() => AttemptEvent::Line(line),
                outcome = join_session(&mut serving) => AttemptEvent::Served(outcome),
                _ = stop.stopped() => AttemptEvent::StopRequested,
            };

            match event {
                AttemptEvent::Line(Some(line)) => {
                    let prepared = login.prepare_line(&line.text);
                    let step = endpoint.update(|record| login.apply_prepared(prepared, record));
                    log_output_line(endpoint, &line, &step);
                    if step.login_succeeded_changed {
                        self.notify_profile_changed(endpoint);
                    }
                    if step.hand_off && serving.is_none() {
                        let session = Arc::clone(&self.session);
                        let handed = endpoint.clone();
                        serving = Some(tokio::spawn(async move { session.serve(&handed).await }));
                    }
                }
                AttemptEvent::Line(None) => {
                    abort_session(&mut serving);
                    let exited = tokio::select! {
                        termination = process.wait_for_exit() => Some(termination),
                        _ = stop.stopped() => None,
                    };
                    let Some(termination) = exited else {
                        debug!(endpoint_id = %endpoint.id(), "stop requested after output closed");
                        stop_endpoint_process(endpoint, &mut process).await;
                        endpoint.update(|record| login.terminate(record));
                        return ServeOutcome::Terminal;
                    };
                    endpoint.update(|record| login.terminate(record));
                    record_termination(endpoint, &termination);
                    return ServeOutcome::Transient {
                        code: ATTEMPT_CODE_PROCESS_EXITED,
                    };
                }
                AttemptEvent::Served(outcome) => {
                    stop_endpoint_process(endpoint, &mut process).await;
                    endpoint.update(|record| login.terminate(record));
                    return outcome;
                }
                AttemptEvent::StopRequested => {
                    abort_session(&mut serving);
                    stop_endpoint_process(endpoint, &mut process).await;
                    endpoint.update(|record| login.terminate(record));
                    return ServeOutcome::Terminal;
                }
            }
        }
    }
}

async fn join_session(task: &mut Option<JoinHandle<ServeOutcome>>) -> ServeOutcome {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(error = %error, "message session task ended abnormally");
            ServeOutcome::Transient {
                code: ATTEMPT_CODE_SESSION_ABORTED,
            }
        }
    }
}

fn abort_session(task: &mut Option<JoinHandle<ServeOutcome>>) {
    if let Some(handle) = task.take() {
        handle.abort();
    }
}

fn spawn_qr_code_announcer(endpoint: EndpointHandle, qr_ready: oneshot::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        if let Ok(image) = qr_ready.await {
            info!(
                endpoint_id = %endpoint.id(),
                bytes = image.len(),
                "qr code ready; scan it with the mobile client to log in"
            );
        }
    });
}

fn log_output_line(endpoint: &EndpointHandle, line: &OutputLine, step: &LoginStep) {
    let stream = line.stream.as_str();
    match step.visibility {
        LineVisibility::Warn => {
            warn!(endpoint_id = %endpoint.id(), stream, "protocol client | {}", step.line)
        }
        LineVisibility::Debug => {
            debug!(endpoint_id = %endpoint.id(), stream, "protocol client | {}", step.line)
        }
        LineVisibility::Trace => {
            trace!(endpoint_id = %endpoint.id(), stream, "protocol client | {}", step.line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_contract::DeviceProtocol;
    use crate::endpoint_state::EndpointProfile;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedSession {
        outcome: ServeOutcome,
        serves: AtomicUsize,
    }

    #[async_trait]
    impl EndpointSessionLayer for ScriptedSession {
        async fn serve(&self, _endpoint: &EndpointHandle) -> ServeOutcome {
            self.serves.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }

        async fn send_group_notice(
            &self,
            _endpoint: &EndpointHandle,
            _group_id: i64,
            _text: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn quit_group(&self, _endpoint: &EndpointHandle, _group_id: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn session(outcome: ServeOutcome) -> Arc<ScriptedSession> {
        Arc::new(ScriptedSession {
            outcome,
            serves: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn unit_attempt_on_non_serving_endpoint_is_terminal_without_serving() {
        let layer = session(ServeOutcome::Transient { code: 1 });
        let attempt = TransportAttempt::new(layer.clone());
        let endpoint = EndpointHandle::new(EndpointProfile::new_transport(
            "QQ",
            "ws://localhost:6700",
            "remote",
        ));
        assert_eq!(attempt.attempt(&endpoint).await, ServeOutcome::Terminal);
        assert_eq!(layer.serves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn functional_transport_attempt_returns_session_outcome() {
        let layer = session(ServeOutcome::Transient { code: 7 });
        let attempt = TransportAttempt::new(layer.clone());
        let endpoint = EndpointHandle::new(EndpointProfile::new_transport(
            "QQ",
            "ws://localhost:6700",
            "remote",
        ));
        endpoint.attach_loop();
        assert_eq!(
            attempt.attempt(&endpoint).await,
            ServeOutcome::Transient { code: 7 }
        );
        assert_eq!(layer.serves.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.state(), EndpointLifecycleState::Terminated);
    }

    #[tokio::test]
    async fn regression_missing_protocol_client_is_transient() {
        let temp = tempdir().expect("tempdir");
        let layer = session(ServeOutcome::Terminal);
        let attempt = ManagedSubprocessAttempt::new(
            temp.path(),
            SubprocessLaunchConfig {
                program: PathBuf::from("/nonexistent/protocol-client"),
                ..SubprocessLaunchConfig::default()
            },
            layer.clone(),
        );
        let endpoint = EndpointHandle::new(EndpointProfile::new_managed(
            "10001",
            "dice",
            DeviceProtocol::Pad,
        ));
        endpoint.attach_loop();

        let outcome = attempt.attempt(&endpoint).await;

        assert_eq!(
            outcome,
            ServeOutcome::Transient {
                code: ATTEMPT_CODE_SPAWN_FAILED
            }
        );
        assert_eq!(layer.serves.load(Ordering::SeqCst), 0);
        let work_dir = temp.path().join("extra/go-cqhttp-qq10001");
        assert!(work_dir.join("device.json").exists());
        assert!(work_dir.join("config.yml").exists());
        assert!(endpoint.profile().connect_url.is_some());
        assert!(endpoint
            .status_report()
            .last_exit
            .is_some_and(|reason| reason.starts_with("spawn failed")));
    }

    #[tokio::test]
    async fn regression_invalid_account_fails_bootstrap_as_transient() {
        let temp = tempdir().expect("tempdir");
        let attempt = ManagedSubprocessAttempt::new(
            temp.path(),
            SubprocessLaunchConfig::default(),
            session(ServeOutcome::Terminal),
        );
        let endpoint = EndpointHandle::new(EndpointProfile::new_managed(
            "abc",
            "dice",
            DeviceProtocol::Pad,
        ));
        endpoint.attach_loop();
        assert_eq!(
            attempt.attempt(&endpoint).await,
            ServeOutcome::Transient {
                code: ATTEMPT_CODE_BOOTSTRAP_FAILED
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_stop_reaches_process_with_closed_output() {
        let temp = tempdir().expect("tempdir");
        let layer = session(ServeOutcome::Terminal);
        let attempt = ManagedSubprocessAttempt::new(
            temp.path(),
            SubprocessLaunchConfig {
                program: PathBuf::from("/bin/sh"),
                args: vec![
                    "-c".to_string(),
                    "exec >&- 2>&-; exec sleep 30".to_string(),
                ],
                ..SubprocessLaunchConfig::default()
            },
            layer,
        );
        let endpoint = EndpointHandle::new(EndpointProfile::new_managed(
            "10001",
            "dice",
            DeviceProtocol::Pad,
        ));
        endpoint.attach_loop();

        let attempting = endpoint.clone();
        let task = tokio::spawn(async move { attempt.attempt(&attempting).await });
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        endpoint.request_stop();

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(3), task)
            .await
            .expect("attempt returns after stop")
            .expect("attempt task");
        assert_eq!(outcome, ServeOutcome::Terminal);
        assert!(!endpoint.status_report().process_running);
    }
}
