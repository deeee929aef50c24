//! Seam to the message-session layer that takes over once a transport is live.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::endpoint_contract::ServeOutcome;
use crate::endpoint_state::EndpointHandle;

pub const DEFAULT_GROUP_QUIT_DELAY: Duration = Duration::from_secs(6);

#[async_trait]
/// Trait contract for `EndpointSessionLayer` behavior.
pub trait EndpointSessionLayer: Send + Sync {
    /// Blocks while connected. Returns [`ServeOutcome::Terminal`] when the
    /// endpoint should not be retried.
    async fn serve(&self, endpoint: &EndpointHandle) -> ServeOutcome;

    async fn send_group_notice(
        &self,
        endpoint: &EndpointHandle,
        group_id: i64,
        text: &str,
    ) -> anyhow::Result<()>;

    async fn quit_group(&self, endpoint: &EndpointHandle, group_id: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Administrator request to leave a group, optionally saying goodbye first.
pub struct GroupQuitRequest {
    pub endpoint_id: String,
    pub group_id: i64,
    #[serde(default)]
    pub farewell: Option<String>,
    /// Skip the farewell notice even when one is provided.
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_group_quit_delay_ms")]
    pub delay_ms: u64,
}

fn default_group_quit_delay_ms() -> u64 {
    DEFAULT_GROUP_QUIT_DELAY.as_millis() as u64
}

impl GroupQuitRequest {
    pub fn new(endpoint_id: impl Into<String>, group_id: i64) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            group_id,
            farewell: None,
            silent: false,
            delay_ms: default_group_quit_delay_ms(),
        }
    }

    pub fn with_farewell(mut self, text: impl Into<String>) -> Self {
        self.farewell = Some(text.into());
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Notice text to send before leaving, if any.
    pub fn farewell_notice(&self) -> Option<&str> {
        if self.silent {
            return None;
        }
        self.farewell
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_group_quit_request_defaults_to_six_second_delay() {
        let request: GroupQuitRequest =
            serde_json::from_str(r#"{"endpoint_id":"e1","group_id":42}"#).expect("parse");
        assert_eq!(request.delay(), Duration::from_secs(6));
        assert_eq!(request, GroupQuitRequest::new("e1", 42));
    }

    #[test]
    fn unit_silent_or_blank_farewell_sends_nothing() {
        let request = GroupQuitRequest::new("e1", 42).with_farewell("  bye  ");
        assert_eq!(request.farewell_notice(), Some("bye"));
        let silent = GroupQuitRequest {
            silent: true,
            ..request.clone()
        };
        assert_eq!(silent.farewell_notice(), None);
        let blank = GroupQuitRequest::new("e1", 42).with_farewell("   ");
        assert_eq!(blank.farewell_notice(), None);
    }
}
