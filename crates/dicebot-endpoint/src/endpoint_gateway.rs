//! Administration surface over the registry and the per-endpoint loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::endpoint_bootstrap::{invalidate_session_token, EndpointWorkspace};
use crate::endpoint_connector::{
    ConnectionAttempt, ManagedSubprocessAttempt, ProfileChangeListener, TransportAttempt,
};
use crate::endpoint_contract::DeviceProtocol;
use crate::endpoint_reconnect::{spawn_reconnect_loop, ReconnectLoopHandle, ReconnectPolicy};
use crate::endpoint_registry::{EndpointRegistry, EndpointRegistryError};
use crate::endpoint_session::{EndpointSessionLayer, GroupQuitRequest};
use crate::endpoint_state::{lock_or_recover, AccountPassword, EndpointHandle, EndpointProfile, EndpointStatusReport};
use crate::endpoint_supervisor::SubprocessLaunchConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointGatewayConfig {
    /// Base for every endpoint's relative work dir.
    pub data_dir: PathBuf,
    pub launch: SubprocessLaunchConfig,
    pub reconnect: ReconnectPolicy,
    /// Protocol selector for newly registered process-backed endpoints.
    pub device_protocol: DeviceProtocol,
}

impl Default for EndpointGatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/default"),
            launch: SubprocessLaunchConfig::default(),
            reconnect: ReconnectPolicy::default(),
            device_protocol: DeviceProtocol::default(),
        }
    }
}

/// Owns the reconnect loops of every endpoint in a registry.
pub struct EndpointGateway {
    config: EndpointGatewayConfig,
    registry: Arc<EndpointRegistry>,
    session: Arc<dyn EndpointSessionLayer>,
    loops: Mutex<HashMap<String, ReconnectLoopHandle>>,
}

impl EndpointGateway {
    pub fn new(
        config: EndpointGatewayConfig,
        registry: Arc<EndpointRegistry>,
        session: Arc<dyn EndpointSessionLayer>,
    ) -> Self {
        Self {
            config,
            registry,
            session,
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EndpointGatewayConfig {
        &self.config
    }

    /// Registers a process-backed endpoint. An empty or missing password
    /// selects QR-code login.
    pub fn register_managed_endpoint(
        &self,
        account_id: &str,
        password: Option<&str>,
        display_name: &str,
    ) -> Result<EndpointStatusReport, EndpointRegistryError> {
        let account_id = account_id.trim();
        if account_id.is_empty() || !account_id.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(EndpointRegistryError::InvalidRegistration(format!(
                "account id '{account_id}' must be numeric"
            )));
        }
        if let Some(existing) = self.registry.find_by_account(account_id) {
            return Err(EndpointRegistryError::DuplicateEndpoint(
                existing.id().to_string(),
            ));
        }
        let profile =
            EndpointProfile::new_managed(account_id, display_name, self.config.device_protocol);
        let handle = self.registry.insert(profile)?;
        handle.set_password(password.map(AccountPassword::new));
        info!(endpoint_id = %handle.id(), account = %account_id, "registered managed endpoint");
        Ok(handle.status_report())
    }

    pub fn register_transport_endpoint(
        &self,
        platform: &str,
        connect_url: &str,
        display_name: &str,
    ) -> Result<EndpointStatusReport, EndpointRegistryError> {
        let connect_url = connect_url.trim();
        if !(connect_url.starts_with("ws://") || connect_url.starts_with("wss://")) {
            return Err(EndpointRegistryError::InvalidRegistration(format!(
                "connect url '{connect_url}' must use ws:// or wss://"
            )));
        }
        if platform.trim().is_empty() {
            return Err(EndpointRegistryError::InvalidRegistration(
                "platform must be non-empty".to_string(),
            ));
        }
        let handle = self.registry.insert(EndpointProfile::new_transport(
            platform,
            connect_url,
            display_name,
        ))?;
        info!(endpoint_id = %handle.id(), platform = %platform, "registered transport endpoint");
        Ok(handle.status_report())
    }

    /// Replaces the in-memory password used when a config file is generated.
    pub fn set_password(&self, id: &str, password: Option<&str>) -> Result<(), EndpointRegistryError> {
        self.registry
            .get(id)?
            .set_password(password.map(AccountPassword::new));
        Ok(())
    }

    /// Marks the endpoint enabled and starts its loop unless one is attached.
    pub fn enable(&self, id: &str) -> Result<EndpointStatusReport, EndpointRegistryError> {
        let handle = self.registry.get(id)?;
        handle.update(|record| record.profile.enabled = true);
        self.registry.persist()?;
        self.start_loop(&handle);
        Ok(handle.status_report())
    }

    /// Marks the endpoint disabled and stops its loop and process.
    pub fn disable(&self, id: &str) -> Result<EndpointStatusReport, EndpointRegistryError> {
        let handle = self.registry.get(id)?;
        handle.update(|record| record.profile.enabled = false);
        handle.request_stop();
        self.registry.persist()?;
        info!(endpoint_id = %id, "endpoint disabled");
        Ok(handle.status_report())
    }

    /// Disables the endpoint, waits for its loop to finish, then forgets it.
    pub async fn remove(&self, id: &str) -> Result<EndpointStatusReport, EndpointRegistryError> {
        self.disable(id)?;
        let running = lock_or_recover(&self.loops).remove(id);
        if let Some(running) = running {
            let exit = running.join().await;
            info!(endpoint_id = %id, exit = ?exit.map(|exit| exit.as_str()), "reconnect loop finished");
        }
        let removed = self.registry.remove(id)?;
        info!(endpoint_id = %id, "endpoint removed");
        Ok(removed.status_report())
    }

    pub fn status(&self, id: &str) -> Result<EndpointStatusReport, EndpointRegistryError> {
        Ok(self.registry.get(id)?.status_report())
    }

    pub fn list(&self) -> Vec<EndpointStatusReport> {
        self.registry
            .handles()
            .iter()
            .map(EndpointHandle::status_report)
            .collect()
    }

    pub fn qr_code(&self, id: &str) -> Result<Option<Vec<u8>>, EndpointRegistryError> {
        Ok(self.registry.get(id)?.qr_code())
    }

    /// Deletes the saved session and forgets that login ever succeeded, so the
    /// next launch regenerates config and device files. Returns whether a
    /// session token was present.
    pub fn invalidate_credentials(&self, id: &str) -> Result<bool, EndpointRegistryError> {
        let handle = self.registry.get(id)?;
        let profile = handle.profile();
        let removed = if profile.connection_kind.is_managed() {
            let workspace = EndpointWorkspace::new(profile.resolve_work_dir(&self.config.data_dir));
            invalidate_session_token(&workspace)?
        } else {
            false
        };
        handle.update(|record| record.profile.login_succeeded = false);
        self.registry.persist()?;
        info!(endpoint_id = %id, session_token_removed = removed, "endpoint credentials invalidated");
        Ok(removed)
    }

    /// Optionally posts a farewell, waits the requested delay, then leaves.
    pub async fn request_group_quit(
        &self,
        request: &GroupQuitRequest,
    ) -> Result<(), EndpointRegistryError> {
        let handle = self.registry.get(&request.endpoint_id)?;
        if !handle.read(|record| record.runtime.login_success) {
            return Err(EndpointRegistryError::NotConnected(
                request.endpoint_id.clone(),
            ));
        }
        if let Some(text) = request.farewell_notice() {
            self.session
                .send_group_notice(&handle, request.group_id, text)
                .await
                .map_err(EndpointRegistryError::Session)?;
        }
        tokio::time::sleep(request.delay()).await;
        self.session
            .quit_group(&handle, request.group_id)
            .await
            .map_err(EndpointRegistryError::Session)?;
        info!(endpoint_id = %request.endpoint_id, group_id = request.group_id, "left group");
        Ok(())
    }

    /// Starts loops for every enabled endpoint. Returns how many were started.
    pub fn start_enabled(&self) -> usize {
        self.registry
            .handles()
            .iter()
            .filter(|handle| handle.is_enabled())
            .filter(|handle| self.start_loop(handle))
            .count()
    }

    /// Stops every loop and waits for all of them to exit.
    pub async fn shutdown(&self) {
        for handle in self.registry.handles() {
            handle.request_stop();
        }
        let running: Vec<ReconnectLoopHandle> =
            lock_or_recover(&self.loops).drain().map(|(_, handle)| handle).collect();
        for handle in running {
            let endpoint_id = handle.endpoint_id().to_string();
            if handle.join().await.is_none() {
                warn!(endpoint_id = %endpoint_id, "reconnect loop ended abnormally");
            }
        }
        info!("endpoint gateway stopped");
    }

    fn start_loop(&self, handle: &EndpointHandle) -> bool {
        let attempt = self.attempt_for(handle);
        let Some(running) = spawn_reconnect_loop(handle, attempt, self.config.reconnect) else {
            return false;
        };
        let mut loops = lock_or_recover(&self.loops);
        loops.retain(|_, existing| !existing.is_finished());
        loops.insert(handle.id().to_string(), running);
        true
    }

    fn attempt_for(&self, handle: &EndpointHandle) -> Arc<dyn ConnectionAttempt> {
        if !handle.profile().connection_kind.is_managed() {
            return Arc::new(TransportAttempt::new(Arc::clone(&self.session)));
        }
        let registry = Arc::clone(&self.registry);
        let listener: ProfileChangeListener = Arc::new(move |endpoint: &EndpointHandle| {
            if let Err(error) = registry.persist() {
                warn!(endpoint_id = %endpoint.id(), error = %error, "failed to persist endpoint registry");
            }
        });
        Arc::new(
            ManagedSubprocessAttempt::new(
                self.config.data_dir.clone(),
                self.config.launch.clone(),
                Arc::clone(&self.session),
            )
            .with_profile_listener(listener),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_contract::ServeOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSession {
        serves: AtomicUsize,
        notices: Mutex<Vec<(i64, String)>>,
        quits: Mutex<Vec<i64>>,
        released: Notify,
    }

    #[async_trait]
    impl EndpointSessionLayer for RecordingSession {
        async fn serve(&self, _endpoint: &EndpointHandle) -> ServeOutcome {
            self.serves.fetch_add(1, Ordering::SeqCst);
            self.released.notified().await;
            ServeOutcome::Transient { code: 1 }
        }

        async fn send_group_notice(
            &self,
            _endpoint: &EndpointHandle,
            group_id: i64,
            text: &str,
        ) -> anyhow::Result<()> {
            self.notices
                .lock()
                .expect("notices")
                .push((group_id, text.to_string()));
            Ok(())
        }

        async fn quit_group(&self, _endpoint: &EndpointHandle, group_id: i64) -> anyhow::Result<()> {
            self.quits.lock().expect("quits").push(group_id);
            Ok(())
        }
    }

    fn test_gateway(data_dir: &std::path::Path) -> (EndpointGateway, Arc<RecordingSession>) {
        let session = Arc::new(RecordingSession::default());
        let registry = Arc::new(
            EndpointRegistry::load(&data_dir.join("endpoints.json")).expect("registry"),
        );
        let config = EndpointGatewayConfig {
            data_dir: data_dir.to_path_buf(),
            ..EndpointGatewayConfig::default()
        };
        (EndpointGateway::new(config, registry, session.clone()), session)
    }

    async fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn unit_registration_validates_inputs() {
        let temp = tempdir().expect("tempdir");
        let (gateway, _) = test_gateway(temp.path());
        assert!(matches!(
            gateway.register_managed_endpoint("12ab", None, "x"),
            Err(EndpointRegistryError::InvalidRegistration(_))
        ));
        assert!(matches!(
            gateway.register_transport_endpoint("QQ", "http://localhost", "x"),
            Err(EndpointRegistryError::InvalidRegistration(_))
        ));
        let first = gateway
            .register_managed_endpoint("10001", Some("secret"), "dice")
            .expect("register");
        assert!(!first.enabled);
        assert!(matches!(
            gateway.register_managed_endpoint("10001", None, "again"),
            Err(EndpointRegistryError::DuplicateEndpoint(_))
        ));
        let raw = std::fs::read_to_string(temp.path().join("endpoints.json")).expect("persisted");
        assert!(!raw.contains("secret"));
    }

    #[tokio::test]
    async fn functional_enable_disable_remove_drive_transport_loop() {
        let temp = tempdir().expect("tempdir");
        let (gateway, session) = test_gateway(temp.path());
        let report = gateway
            .register_transport_endpoint("QQ", "ws://localhost:6700", "remote")
            .expect("register");

        let enabled = gateway.enable(&report.id).expect("enable");
        assert!(enabled.enabled && enabled.serving);
        wait_for(|| session.serves.load(Ordering::SeqCst) == 1).await;
        assert_eq!(gateway.status(&report.id).expect("status").state, "serving");
        gateway.enable(&report.id).expect("enable twice");
        assert_eq!(session.serves.load(Ordering::SeqCst), 1);

        let disabled = gateway.disable(&report.id).expect("disable");
        assert!(!disabled.enabled && !disabled.serving);
        let removed = gateway.remove(&report.id).await.expect("remove");
        assert_eq!(removed.id, report.id);
        assert!(!removed.loop_attached);
        assert!(gateway.list().is_empty());
        assert!(matches!(
            gateway.status(&report.id),
            Err(EndpointRegistryError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn functional_start_enabled_and_shutdown_cover_persisted_endpoints() {
        let temp = tempdir().expect("tempdir");
        let id = {
            let (gateway, _) = test_gateway(temp.path());
            let report = gateway
                .register_transport_endpoint("QQ", "ws://localhost:6700", "remote")
                .expect("register");
            gateway
                .register_transport_endpoint("QQ", "ws://localhost:6701", "idle")
                .expect("register idle");
            gateway.registry().get(&report.id).expect("handle").update(|record| {
                record.profile.enabled = true;
            });
            gateway.registry().persist().expect("persist");
            report.id
        };

        let (gateway, session) = test_gateway(temp.path());
        assert_eq!(gateway.start_enabled(), 1);
        wait_for(|| session.serves.load(Ordering::SeqCst) == 1).await;
        assert!(gateway.status(&id).expect("status").loop_attached);

        gateway.shutdown().await;
        let status = gateway.status(&id).expect("status");
        assert!(!status.serving);
        assert!(!status.loop_attached);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_group_quit_sends_farewell_then_waits_before_leaving() {
        let temp = tempdir().expect("tempdir");
        let (gateway, session) = test_gateway(temp.path());
        let report = gateway
            .register_transport_endpoint("QQ", "ws://localhost:6700", "remote")
            .expect("register");
        let request = GroupQuitRequest::new(report.id.clone(), 42).with_farewell("bye");

        assert!(matches!(
            gateway.request_group_quit(&request).await,
            Err(EndpointRegistryError::NotConnected(_))
        ));

        gateway
            .registry()
            .get(&report.id)
            .expect("handle")
            .update(|record| record.runtime.login_success = true);
        let started = tokio::time::Instant::now();
        gateway.request_group_quit(&request).await.expect("quit");

        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(
            session.notices.lock().expect("notices").clone(),
            vec![(42, "bye".to_string())]
        );
        assert_eq!(session.quits.lock().expect("quits").clone(), vec![42]);
    }

    #[test]
    fn functional_invalidate_credentials_clears_durable_login_marker() {
        let temp = tempdir().expect("tempdir");
        let (gateway, _) = test_gateway(temp.path());
        let report = gateway
            .register_managed_endpoint("10001", None, "dice")
            .expect("register");
        let handle = gateway.registry().get(&report.id).expect("handle");
        handle.update(|record| record.profile.login_succeeded = true);
        let work_dir = temp.path().join("extra/go-cqhttp-qq10001");
        std::fs::create_dir_all(&work_dir).expect("mkdir");
        std::fs::write(work_dir.join("session.token"), "token").expect("token");

        assert!(gateway.invalidate_credentials(&report.id).expect("invalidate"));

        assert!(!work_dir.join("session.token").exists());
        assert!(!gateway.status(&report.id).expect("status").login_succeeded);
        let reloaded = EndpointRegistry::load(&temp.path().join("endpoints.json")).expect("reload");
        assert!(!reloaded.get(&report.id).expect("endpoint").profile().login_succeeded);
    }
}
