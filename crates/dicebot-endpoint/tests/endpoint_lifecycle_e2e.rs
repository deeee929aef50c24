#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicebot_endpoint::{
    EndpointGateway, EndpointGatewayConfig, EndpointHandle, EndpointLifecycleState,
    EndpointRegistry, EndpointSessionLayer, ReconnectPolicy, ServeOutcome,
    SubprocessLaunchConfig, ENDPOINT_REGISTRY_FILE_NAME,
};
use tempfile::tempdir;
use tokio::sync::Notify;

const LOGIN_SCRIPT: &str = "echo $$ > client.pid; \
     printf 'fake-qr-image' > qrcode.png; \
     echo '[INFO]: 请使用手机QQ扫描二维码 (qrcode.png) :'; \
     sleep 0.2; \
     echo '[INFO]: CQ WebSocket 服务器已启动: 127.0.0.1:6700'; \
     echo '[INFO]: CQ WebSocket 服务器已启动: 127.0.0.1:6700'; \
     exec sleep 30";

const CRASHING_SCRIPT: &str = "echo launch >> launches.log; echo '[ERROR]: connection lost'; exit 1";

#[derive(Default)]
struct HandOffCounter {
    hand_offs: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl EndpointSessionLayer for HandOffCounter {
    async fn serve(&self, _endpoint: &EndpointHandle) -> ServeOutcome {
        self.hand_offs.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        ServeOutcome::Terminal
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

fn shell_launch(script: &str) -> SubprocessLaunchConfig {
    SubprocessLaunchConfig {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        ..SubprocessLaunchConfig::default()
    }
}

fn build_gateway(
    data_dir: &Path,
    script: &str,
    session: Arc<HandOffCounter>,
) -> EndpointGateway {
    let registry = Arc::new(
        EndpointRegistry::load(&data_dir.join(ENDPOINT_REGISTRY_FILE_NAME)).expect("registry"),
    );
    let config = EndpointGatewayConfig {
        data_dir: data_dir.to_path_buf(),
        launch: shell_launch(script),
        reconnect: ReconnectPolicy::from_seconds(15),
        ..EndpointGatewayConfig::default()
    };
    EndpointGateway::new(config, registry, session)
}

async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn process_is_running(pid: u32) -> bool {
    let liveness = format!("kill -0 {pid} >/dev/null 2>&1");
    Command::new("/bin/sh")
        .args(["-c", liveness.as_str()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn integration_fresh_endpoint_logs_in_and_hands_off_once() {
    let temp = tempdir().expect("tempdir");
    let session = Arc::new(HandOffCounter::default());
    let gateway = build_gateway(temp.path(), LOGIN_SCRIPT, session.clone());
    let report = gateway
        .register_managed_endpoint("10001", None, "dice")
        .expect("register");
    assert!(!report.login_succeeded);
    let work_dir = temp.path().join("extra/go-cqhttp-qq10001");

    gateway.enable(&report.id).expect("enable");
    wait_until(Duration::from_secs(5), || {
        gateway
            .status(&report.id)
            .map(|status| status.state == EndpointLifecycleState::Serving.as_str())
            .unwrap_or(false)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(work_dir.join("device.json").exists());
    assert!(work_dir.join("config.yml").exists());
    let status = gateway.status(&report.id).expect("status");
    assert!(status.login_succeeded);
    assert!(status.login_success);
    assert!(status.qr_code_ready);
    assert!(status.process_running);
    assert!(status
        .connect_url
        .as_deref()
        .is_some_and(|url| url.starts_with("ws://localhost:")));
    assert_eq!(
        gateway.qr_code(&report.id).expect("qr"),
        Some(b"fake-qr-image".to_vec())
    );
    assert_eq!(session.hand_offs.load(Ordering::SeqCst), 1);

    let persisted = EndpointRegistry::load(&temp.path().join(ENDPOINT_REGISTRY_FILE_NAME))
        .expect("reload registry");
    assert!(persisted
        .get(&report.id)
        .expect("persisted endpoint")
        .profile()
        .login_succeeded);

    let pid: u32 = std::fs::read_to_string(work_dir.join("client.pid"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    assert!(process_is_running(pid));

    gateway.remove(&report.id).await.expect("remove");
    wait_until(Duration::from_secs(2), || !process_is_running(pid)).await;
    assert_eq!(session.hand_offs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn integration_terminal_session_outcome_stops_process_without_retry() {
    let temp = tempdir().expect("tempdir");
    let session = Arc::new(HandOffCounter::default());
    let gateway = build_gateway(temp.path(), LOGIN_SCRIPT, session.clone());
    let report = gateway
        .register_managed_endpoint("10002", None, "dice")
        .expect("register");

    gateway.enable(&report.id).expect("enable");
    wait_until(Duration::from_secs(5), || {
        session.hand_offs.load(Ordering::SeqCst) == 1
    })
    .await;
    session.release.notify_one();

    wait_until(Duration::from_secs(5), || {
        gateway
            .status(&report.id)
            .map(|status| !status.loop_attached)
            .unwrap_or(false)
    })
    .await;
    let status = gateway.status(&report.id).expect("status");
    assert!(!status.serving);
    assert!(!status.process_running);
    assert_eq!(status.state, EndpointLifecycleState::Terminated.as_str());
    assert_eq!(session.hand_offs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn regression_disable_during_backoff_prevents_next_launch() {
    let temp = tempdir().expect("tempdir");
    let session = Arc::new(HandOffCounter::default());
    let gateway = build_gateway(temp.path(), CRASHING_SCRIPT, session.clone());
    let report = gateway
        .register_managed_endpoint("10003", None, "dice")
        .expect("register");
    let launches = temp.path().join("extra/go-cqhttp-qq10003/launches.log");

    gateway.enable(&report.id).expect("enable");
    wait_until(Duration::from_secs(5), || {
        gateway
            .status(&report.id)
            .map(|status| status.last_exit.is_some() && !status.process_running)
            .unwrap_or(false)
    })
    .await;

    gateway.disable(&report.id).expect("disable");
    gateway.remove(&report.id).await.expect("remove");

    let launched = std::fs::read_to_string(&launches).expect("launch log");
    assert_eq!(launched.lines().count(), 1);
    assert_eq!(session.hand_offs.load(Ordering::SeqCst), 0);
}
