use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::auth::AuthedAgent;
use crate::backoff::Backoff;
use crate::error::BridgeError;
use crate::models::{Conversation, HistoryAccess, Message, MessageQuery, MessageType, NewMessage};
use crate::store::Store;

pub const MIN_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

/// Reply policy: passive answers only `@name` mentions, active answers every
/// unread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Passive,
    Active,
}

impl AgentMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passive" => Some(AgentMode::Passive),
            "active" => Some(AgentMode::Active),
            _ => None,
        }
    }
}

/// The model seam. Implementations get the assembled prompt and return the
/// reply body.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn reply(&self, system_prompt: Option<&str>, prompt: &str)
    -> Result<String, BridgeError>;
}

/// Seam between local mode (direct store access) and remote mode (JSON-RPC
/// over /mcp). The loop only ever talks through this.
#[async_trait]
pub trait BridgeConnection: Send {
    async fn list_conversations(&mut self) -> Result<Vec<Conversation>, BridgeError>;
    /// Conversation ids the agent is currently subscribed to.
    async fn subscriptions(&mut self) -> Result<Vec<String>, BridgeError>;
    async fn subscribe(
        &mut self,
        conversation_id: &str,
        history_access: HistoryAccess,
    ) -> Result<(), BridgeError>;
    async fn unread_messages(&mut self, conversation_id: &str)
    -> Result<Vec<Message>, BridgeError>;
    async fn send_message(
        &mut self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, BridgeError>;
    async fn mark_read(
        &mut self,
        conversation_id: &str,
        up_to_message_id: &str,
    ) -> Result<(), BridgeError>;
    /// Drop any session state so the next call re-initializes.
    async fn reset(&mut self) -> Result<(), BridgeError>;
    /// Best-effort teardown.
    async fn close(&mut self);
}

pub struct AgentLoopConfig {
    pub agent_id: String,
    pub agent_name: String,
    pub mode: AgentMode,
    pub poll_interval_ms: u64,
    pub system_prompt: Option<String>,
}

/// Embed an agent into the bridge: discover conversations, subscribe, poll
/// unread messages, invoke the adapter, reply, mark read.
///
/// Reply ordering is strict: `mark_read` only runs after `send_message`
/// succeeds, so a failed adapter or send leaves the batch unread for the next
/// tick (at-least-once).
pub async fn run_agent<C>(
    conn: &mut C,
    adapter: &dyn Adapter,
    cfg: &AgentLoopConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError>
where
    C: BridgeConnection + ?Sized,
{
    let mention_re = mention_regex(&cfg.agent_name)?;
    let poll = Duration::from_millis(cfg.poll_interval_ms.max(MIN_POLL_INTERVAL_MS));
    let mut backoff = Backoff::new();

    info!(agent = %cfg.agent_name, mode = ?cfg.mode, "agent loop starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let tick_result = tokio::select! {
            r = tick(conn, adapter, cfg, &mention_re) => r,
            _ = shutdown.changed() => break,
        };

        match tick_result {
            Ok(()) => backoff.reset(),
            Err(BridgeError::SessionExpired) => {
                warn!(agent = %cfg.agent_name, "session expired; resetting before next tick");
                conn.reset().await.ok();
            }
            Err(e) => {
                let delay = backoff.next_delay();
                let delay_ms = delay.as_millis() as u64;
                warn!(
                    agent = %cfg.agent_name,
                    failures = backoff.failures(),
                    delay_ms,
                    "tick failed: {e}"
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        }

        tokio::select! {
            _ = sleep(poll) => {}
            _ = shutdown.changed() => break,
        }
    }

    conn.close().await;
    info!(agent = %cfg.agent_name, "agent loop stopped");
    Ok(())
}

/// Case-insensitive `@<name>` matcher; the name is regex-escaped.
fn mention_regex(agent_name: &str) -> Result<Regex, BridgeError> {
    RegexBuilder::new(&format!("@{}", regex::escape(agent_name)))
        .case_insensitive(true)
        .build()
        .map_err(|e| BridgeError::Validation(format!("Invalid agent name for mentions: {e}")))
}

async fn tick<C>(
    conn: &mut C,
    adapter: &dyn Adapter,
    cfg: &AgentLoopConfig,
    mention_re: &Regex,
) -> Result<(), BridgeError>
where
    C: BridgeConnection + ?Sized,
{
    // Discovery: join every conversation we are not yet part of
    let subscribed: HashSet<String> = conn.subscriptions().await?.into_iter().collect();
    let conversations = conn.list_conversations().await?;
    for conversation in &conversations {
        if !subscribed.contains(&conversation.id) {
            debug!(agent = %cfg.agent_name, conversation = %conversation.id, "subscribing");
            conn.subscribe(&conversation.id, HistoryAccess::FromJoin)
                .await?;
        }
    }

    for conversation in &conversations {
        let mut batch = conn.unread_messages(&conversation.id).await?;
        // Never answer ourselves; without this the agent replies to its own replies
        batch.retain(|m| m.from_agent != cfg.agent_id);
        if cfg.mode == AgentMode::Passive {
            batch.retain(|m| mention_re.is_match(&m.content));
        }
        let Some(last) = batch.last() else { continue };
        let last_id = last.id.clone();

        // Batches arrive ascending (created_at, id); concatenate in that order
        let prompt = batch
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let reply = adapter.reply(cfg.system_prompt.as_deref(), &prompt).await?;
        conn.send_message(&conversation.id, &reply).await?;
        // Only after the reply landed; a failure above leaves the batch unread
        conn.mark_read(&conversation.id, &last_id).await?;
        debug!(
            agent = %cfg.agent_name,
            conversation = %conversation.id,
            batch = batch.len(),
            "replied and marked read"
        );
    }

    Ok(())
}

/// In-process connection for agents hosted next to the store.
pub struct LocalBridge {
    store: Arc<Store>,
    agent: AuthedAgent,
}

impl LocalBridge {
    pub fn new(store: Arc<Store>, agent: AuthedAgent) -> Self {
        LocalBridge { store, agent }
    }
}

#[async_trait]
impl BridgeConnection for LocalBridge {
    async fn list_conversations(&mut self) -> Result<Vec<Conversation>, BridgeError> {
        self.store
            .list_conversations(None, None)
            .map_err(|e| BridgeError::Unreachable(e.to_string()))
    }

    async fn subscriptions(&mut self) -> Result<Vec<String>, BridgeError> {
        Ok(self
            .store
            .list_subscriptions_for_agent(&self.agent.id)
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?
            .into_iter()
            .map(|s| s.conversation_id)
            .collect())
    }

    async fn subscribe(
        &mut self,
        conversation_id: &str,
        history_access: HistoryAccess,
    ) -> Result<(), BridgeError> {
        self.store
            .subscribe(conversation_id, &self.agent.id, history_access)
            .map(|_| ())
            .map_err(|e| BridgeError::Unreachable(e.to_string()))
    }

    async fn unread_messages(
        &mut self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, BridgeError> {
        self.store
            .get_messages(
                conversation_id,
                &self.agent.id,
                self.agent.clearance_level,
                &MessageQuery {
                    unread_only: true,
                    ..MessageQuery::default()
                },
            )
            .map_err(|e| BridgeError::Unreachable(e.to_string()))
    }

    async fn send_message(
        &mut self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, BridgeError> {
        self.store
            .send_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                from_agent: self.agent.id.clone(),
                content: content.to_string(),
                msg_type: MessageType::Message,
                visibility: None,
                metadata: None,
            })
            .map_err(|e| BridgeError::Unreachable(e.to_string()))
    }

    async fn mark_read(
        &mut self,
        conversation_id: &str,
        up_to_message_id: &str,
    ) -> Result<(), BridgeError> {
        self.store
            .mark_read(conversation_id, &self.agent.id, Some(up_to_message_id))
            .map(|_| ())
            .map_err(|e| BridgeError::Unreachable(e.to_string()))
    }

    async fn reset(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn close(&mut self) {}
}
