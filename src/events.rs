use serde_json::json;
use tokio::sync::broadcast;

use crate::models::{Message, Visibility};
use crate::rpc;

/// Buffered so a slow SSE consumer lags instead of blocking writers.
const EVENT_BUFFER: usize = 1024;

/// Store mutations fanned out to live sessions.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    MessageCreated(Message),
}

impl BridgeEvent {
    /// Conversation the event belongs to; sessions only receive events for
    /// conversations their agent is subscribed to.
    pub fn conversation_id(&self) -> &str {
        match self {
            BridgeEvent::MessageCreated(m) => &m.conversation_id,
        }
    }

    /// Read-side visibility: the viewer's clearance covers the message, or
    /// the viewer authored it. Subscription membership is the session
    /// layer's half of the filter.
    pub fn visible_to(&self, agent_id: &str, clearance: Visibility) -> bool {
        match self {
            BridgeEvent::MessageCreated(m) => {
                clearance >= m.visibility || m.from_agent == agent_id
            }
        }
    }

    /// JSON-RPC notification frame carried on the SSE channel.
    pub fn to_notification(&self) -> serde_json::Value {
        match self {
            BridgeEvent::MessageCreated(m) => rpc::notification(
                "notifications/message",
                json!({"conversation_id": m.conversation_id, "message": m}),
            ),
        }
    }
}

/// In-process pub/sub between the store and open SSE sessions. Holds no
/// state beyond current listeners; receivers re-attach by reopening their
/// session after a restart.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        EventBus { sender }
    }

    /// Dispatch never fails into the emitter: a bus with no open sessions
    /// drops the event, and lagged receivers resynchronize on their next
    /// recv.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }
}
