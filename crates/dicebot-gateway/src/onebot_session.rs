//! Websocket message session over an endpoint's OneBot transport.
//!
//! Inbound frames are drained but not interpreted; the session only keeps the
//! connection alive and carries outbound administrative actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dicebot_endpoint::{EndpointHandle, EndpointSessionLayer, ServeOutcome};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

const SESSION_CODE_MISSING_URL: i32 = 1;
const SESSION_CODE_CONNECT_FAILED: i32 = 2;
const SESSION_CODE_CLOSED: i32 = 3;
const SESSION_CODE_SEND_FAILED: i32 = 4;

pub(crate) fn group_message_action(group_id: i64, text: &str) -> Value {
    json!({
        "action": "send_group_msg",
        "params": {
            "group_id": group_id,
            "message": text,
        },
    })
}

pub(crate) fn group_leave_action(group_id: i64) -> Value {
    json!({
        "action": "set_group_leave",
        "params": {
            "group_id": group_id,
            "is_dismiss": false,
        },
    })
}

/// One websocket per serving endpoint, addressed by endpoint id.
pub(crate) struct OneBotWebsocketSession {
    connect_timeout: Duration,
    outbound: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl OneBotWebsocketSession {
    pub(crate) fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            outbound: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn send_action(&self, endpoint: &EndpointHandle, action: Value) -> Result<()> {
        let sender = lock_or_recover(&self.outbound)
            .get(endpoint.id())
            .cloned()
            .ok_or_else(|| anyhow!("endpoint '{}' has no open websocket session", endpoint.id()))?;
        sender
            .send(action.to_string())
            .map_err(|_| anyhow!("websocket session for '{}' closed", endpoint.id()))
    }
}

#[async_trait]
impl EndpointSessionLayer for OneBotWebsocketSession {
    async fn serve(&self, endpoint: &EndpointHandle) -> ServeOutcome {
        let mut stop = endpoint.subscribe_stop();
        if !endpoint.is_serving() {
            return ServeOutcome::Terminal;
        }
        let Some(url) = endpoint.read(|record| record.profile.connect_url.clone()) else {
            warn!(endpoint_id = %endpoint.id(), "endpoint has no connect url");
            return ServeOutcome::Transient {
                code: SESSION_CODE_MISSING_URL,
            };
        };

        let connected = tokio::select! {
            _ = stop.stopped() => return ServeOutcome::Terminal,
            connected = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())) => connected,
        };
        let stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(error)) => {
                warn!(endpoint_id = %endpoint.id(), url = %url, error = %error, "websocket connect failed");
                return ServeOutcome::Transient {
                    code: SESSION_CODE_CONNECT_FAILED,
                };
            }
            Err(_) => {
                warn!(endpoint_id = %endpoint.id(), url = %url, timeout = ?self.connect_timeout, "websocket connect timed out");
                return ServeOutcome::Transient {
                    code: SESSION_CODE_CONNECT_FAILED,
                };
            }
        };
        info!(endpoint_id = %endpoint.id(), url = %url, "message session connected");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        lock_or_recover(&self.outbound).insert(endpoint.id().to_string(), outbound_tx.clone());

        let outcome = loop {
            tokio::select! {
                _ = stop.stopped() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break ServeOutcome::Terminal;
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(error) = sink.send(WsMessage::Text(frame.into())).await {
                        warn!(endpoint_id = %endpoint.id(), error = %error, "websocket send failed");
                        break ServeOutcome::Transient { code: SESSION_CODE_SEND_FAILED };
                    }
                }
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(endpoint_id = %endpoint.id(), frame = ?frame, "websocket closed by peer");
                        break ServeOutcome::Transient { code: SESSION_CODE_CLOSED };
                    }
                    Some(Ok(message)) => {
                        debug!(endpoint_id = %endpoint.id(), bytes = message.len(), "websocket frame drained");
                    }
                    Some(Err(error)) => {
                        warn!(endpoint_id = %endpoint.id(), error = %error, "websocket read failed");
                        break ServeOutcome::Transient { code: SESSION_CODE_CLOSED };
                    }
                    None => break ServeOutcome::Transient { code: SESSION_CODE_CLOSED },
                },
            }
        };

        let mut outbound = lock_or_recover(&self.outbound);
        if outbound
            .get(endpoint.id())
            .is_some_and(|registered| registered.same_channel(&outbound_tx))
        {
            outbound.remove(endpoint.id());
        }
        outcome
    }

    async fn send_group_notice(
        &self,
        endpoint: &EndpointHandle,
        group_id: i64,
        text: &str,
    ) -> Result<()> {
        self.send_action(endpoint, group_message_action(group_id, text))
            .context("failed to send group notice")
    }

    async fn quit_group(&self, endpoint: &EndpointHandle, group_id: i64) -> Result<()> {
        self.send_action(endpoint, group_leave_action(group_id))
            .context("failed to leave group")
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
