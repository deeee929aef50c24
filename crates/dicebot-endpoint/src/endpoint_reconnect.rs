//! Per-endpoint supervisory loop: attempt, back off, repeat until disabled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::endpoint_connector::ConnectionAttempt;
use crate::endpoint_state::{EndpointHandle, EndpointStopSignal};

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed sleep between a transient failure and the next attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            backoff: Duration::from_secs(seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `ReconnectLoopExit` values.
pub enum ReconnectLoopExit {
    /// The serving flag was cleared.
    Disabled,
    /// An attempt reported an intentional, do-not-retry outcome.
    Terminal,
}

impl ReconnectLoopExit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Debug)]
pub struct ReconnectLoopHandle {
    endpoint_id: String,
    task: JoinHandle<ReconnectLoopExit>,
}

impl ReconnectLoopHandle {
    pub fn endpoint_id(&self) -> &str {
        self.endpoint_id.as_str()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit. `None` when the task panicked or was aborted.
    pub async fn join(self) -> Option<ReconnectLoopExit> {
        self.task.await.ok()
    }
}

/// Starts the loop for `endpoint` unless one is already attached, in which
/// case the endpoint is only re-marked as serving and `None` is returned.
pub fn spawn_reconnect_loop(
    endpoint: &EndpointHandle,
    attempt: Arc<dyn ConnectionAttempt>,
    policy: ReconnectPolicy,
) -> Option<ReconnectLoopHandle> {
    if !endpoint.attach_loop() {
        info!(endpoint_id = %endpoint.id(), "reconnect loop already attached");
        return None;
    }
    let looped = endpoint.clone();
    let task = tokio::spawn(async move { run_reconnect_loop(looped, attempt, policy).await });
    Some(ReconnectLoopHandle {
        endpoint_id: endpoint.id().to_string(),
        task,
    })
}

/// Detaches the loop if its task unwinds.
struct LoopAttachment {
    endpoint: EndpointHandle,
    released: bool,
}

impl LoopAttachment {
    fn release(&mut self) {
        self.released = true;
    }
}

impl Drop for LoopAttachment {
    fn drop(&mut self) {
        if !self.released {
            self.endpoint.detach_loop();
        }
    }
}

/// Body of the reconnect loop. The serving flag is checked before and after
/// every attempt. Attempts are spaced by at least the backoff: a stop request
/// ends the wait early only when the endpoint is no longer serving.
pub async fn run_reconnect_loop(
    endpoint: EndpointHandle,
    attempt: Arc<dyn ConnectionAttempt>,
    policy: ReconnectPolicy,
) -> ReconnectLoopExit {
    let mut attachment = LoopAttachment {
        endpoint: endpoint.clone(),
        released: false,
    };
    let mut stop = endpoint.subscribe_stop();
    let mut attempts = 0_u64;
    let mut next_attempt_at: Option<Instant> = None;

    loop {
        if endpoint.detach_loop_if_not_serving() {
            attachment.release();
            info!(endpoint_id = %endpoint.id(), attempts, "endpoint disabled; reconnect loop exits");
            return ReconnectLoopExit::Disabled;
        }
        if let Some(deadline) = next_attempt_at {
            if Instant::now() < deadline {
                wait_for_next_attempt(&endpoint, &mut stop, deadline).await;
                continue;
            }
        }

        attempts = attempts.saturating_add(1);
        info!(endpoint_id = %endpoint.id(), attempt = attempts, "connecting endpoint");
        stop.take_fired();
        let started = Instant::now();
        let outcome = attempt.attempt(&endpoint).await;
        let stopped_during_attempt = stop.take_fired();

        if endpoint.detach_loop_if_not_serving() {
            attachment.release();
            info!(endpoint_id = %endpoint.id(), attempts, "endpoint disabled; reconnect loop exits");
            return ReconnectLoopExit::Disabled;
        }
        if outcome.is_terminal() {
            if stopped_during_attempt {
                // Stopped and re-enabled while the attempt wound down.
                info!(endpoint_id = %endpoint.id(), attempts, "endpoint re-enabled during stop; restarting");
                next_attempt_at = Some(started + policy.backoff);
                continue;
            }
            endpoint.detach_loop();
            attachment.release();
            info!(endpoint_id = %endpoint.id(), attempts, "endpoint session ended; no retry");
            return ReconnectLoopExit::Terminal;
        }

        warn!(
            endpoint_id = %endpoint.id(),
            code = outcome.status_code(),
            backoff_secs = policy.backoff.as_secs(),
            "endpoint disconnected; reconnecting after backoff"
        );
        next_attempt_at = Some(Instant::now() + policy.backoff);
    }
}

/// Sleeps until `deadline`. Returns early only when a stop request leaves the
/// endpoint not serving; a stop followed by a re-enable keeps waiting.
async fn wait_for_next_attempt(
    endpoint: &EndpointHandle,
    stop: &mut EndpointStopSignal,
    deadline: Instant,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return,
            _ = stop.stopped() => {
                if !endpoint.is_serving() {
                    return;
                }
            }
        }
    }
}
