use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;

use crate::auth::AuthedAgent;
use crate::models::*;
use crate::rpc;
use crate::store::{Store, StoreError};

// Validation limits applied before any store access.
pub const MAX_ID_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5_000;
pub const MAX_TYPE_LEN: usize = 50;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_TAGS: usize = 20;
pub const MAX_CAPABILITIES: usize = 20;
pub const MAX_MESSAGE_CONTENT: usize = 100 * 1024;
pub const MAX_MEMORY_CONTENT: usize = 50 * 1024;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Domain(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn code(&self) -> i64 {
        match self {
            ToolError::Validation(_) => rpc::INVALID_PARAMS,
            ToolError::NotFound(_) => rpc::NOT_FOUND,
            ToolError::Domain(_) => rpc::DOMAIN_ERROR,
            ToolError::Internal(_) => rpc::INTERNAL_ERROR,
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ToolError::NotFound(format!("{what} not found")),
            StoreError::NotSubscribed => {
                ToolError::Domain("Not subscribed to conversation".into())
            }
            StoreError::Invalid(msg) => ToolError::Validation(msg),
            StoreError::Db(e) => ToolError::Internal(e.to_string()),
        }
    }
}

/// Execute a named tool against the store under the caller's identity.
/// Clearance filters are applied read-side inside the store.
pub fn dispatch(
    store: &Store,
    caller: &AuthedAgent,
    name: &str,
    args: Value,
) -> Result<Value, ToolError> {
    match name {
        "register_agent" => register_agent(store, caller, parse(args)?),
        "list_bridge_agents" => list_bridge_agents(store, parse(args)?),
        "create_project" => create_project(store, caller, parse(args)?),
        "list_projects" => list_projects(store),
        "set_memory" => set_memory(store, caller, parse(args)?),
        "get_memory" => get_memory(store, parse(args)?),
        "delete_memory" => delete_memory(store, parse(args)?),
        "create_conversation" => create_conversation(store, caller, parse(args)?),
        "list_conversations" => list_conversations(store, parse(args)?),
        "subscribe" => subscribe(store, caller, parse(args)?),
        "unsubscribe" => unsubscribe(store, caller, parse(args)?),
        "list_subscribers" => list_subscribers(store, parse(args)?),
        "send_message" => send_message(store, caller, parse(args)?),
        "get_messages" => get_messages(store, caller, parse(args)?),
        "get_status" => get_status(store, caller),
        "mark_read" => mark_read(store, caller, parse(args)?),
        other => Err(ToolError::NotFound(format!("Unknown tool '{other}'"))),
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::Validation(format!("Invalid params: {e}")))
}

// --- Field validators ---

fn check_len(field: &str, value: &str, max: usize) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(ToolError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn check_opt_len(field: &str, value: Option<&str>, max: usize) -> Result<(), ToolError> {
    if let Some(v) = value {
        if v.len() > max {
            return Err(ToolError::Validation(format!(
                "{field} must be at most {max} characters"
            )));
        }
    }
    Ok(())
}

fn check_string_array(
    field: &str,
    values: &[String],
    max_items: usize,
    max_len: usize,
) -> Result<(), ToolError> {
    if values.len() > max_items {
        return Err(ToolError::Validation(format!(
            "{field} must have at most {max_items} elements"
        )));
    }
    for v in values {
        if v.len() > max_len {
            return Err(ToolError::Validation(format!(
                "{field} elements must be at most {max_len} characters"
            )));
        }
    }
    Ok(())
}

// --- Agents ---

fn register_agent(
    store: &Store,
    caller: &AuthedAgent,
    p: RegisterAgentParams,
) -> Result<Value, ToolError> {
    check_len("name", &p.name, MAX_NAME_LEN)?;
    check_opt_len("type", p.agent_type.as_deref(), MAX_TYPE_LEN)?;
    let capabilities = p.capabilities.unwrap_or_default();
    check_string_array("capabilities", &capabilities, MAX_CAPABILITIES, MAX_NAME_LEN)?;
    let agent = store.update_agent_profile(
        &caller.id,
        p.name.trim(),
        p.agent_type.as_deref().unwrap_or("agent"),
        &capabilities,
    )?;
    Ok(json!({"agent": agent}))
}

fn list_bridge_agents(store: &Store, p: ListBridgeAgentsParams) -> Result<Value, ToolError> {
    check_opt_len("project_id", p.project_id.as_deref(), MAX_ID_LEN)?;
    let agents = store.list_agents(p.project_id.as_deref())?;
    Ok(json!({"count": agents.len(), "agents": agents}))
}

// --- Projects ---

fn create_project(
    store: &Store,
    caller: &AuthedAgent,
    p: CreateProjectParams,
) -> Result<Value, ToolError> {
    check_len("name", &p.name, MAX_NAME_LEN)?;
    check_opt_len("description", p.description.as_deref(), MAX_DESCRIPTION_LEN)?;
    let project = store.create_project(
        p.name.trim(),
        p.description.as_deref(),
        p.visibility.unwrap_or(Visibility::Team),
        p.confidentiality_mode.unwrap_or(ConfidentialityMode::Normal),
        &caller.id,
    )?;
    Ok(json!({"project": project}))
}

fn list_projects(store: &Store) -> Result<Value, ToolError> {
    let projects = store.list_projects()?;
    Ok(json!({"count": projects.len(), "projects": projects}))
}

// --- Project memory ---

fn set_memory(store: &Store, caller: &AuthedAgent, p: SetMemoryParams) -> Result<Value, ToolError> {
    check_len("project_id", &p.project_id, MAX_ID_LEN)?;
    check_len("content", &p.content, MAX_MEMORY_CONTENT)?;
    check_opt_len("key", p.key.as_deref(), MAX_ID_LEN)?;
    check_opt_len("type", p.memory_type.as_deref(), MAX_TYPE_LEN)?;
    let tags = p.tags.unwrap_or_default();
    check_string_array("tags", &tags, MAX_TAGS, MAX_TAG_LEN)?;
    let note = store.set_memory(
        &p.project_id,
        &p.content,
        p.key.as_deref(),
        &tags,
        p.memory_type.as_deref().unwrap_or("note"),
        &caller.id,
    )?;
    Ok(json!({"memory": note}))
}

fn get_memory(store: &Store, p: GetMemoryParams) -> Result<Value, ToolError> {
    check_len("project_id", &p.project_id, MAX_ID_LEN)?;
    check_opt_len("key", p.key.as_deref(), MAX_ID_LEN)?;
    check_opt_len("type", p.memory_type.as_deref(), MAX_TYPE_LEN)?;
    let tags = p.tags.unwrap_or_default();
    check_string_array("tags", &tags, MAX_TAGS, MAX_TAG_LEN)?;
    let notes = store.get_memory(
        &p.project_id,
        p.key.as_deref(),
        if tags.is_empty() { None } else { Some(&tags) },
        p.memory_type.as_deref(),
    )?;
    Ok(json!({"count": notes.len(), "memories": notes}))
}

fn delete_memory(store: &Store, p: DeleteMemoryParams) -> Result<Value, ToolError> {
    check_len("project_id", &p.project_id, MAX_ID_LEN)?;
    check_len("memory_id", &p.memory_id, MAX_ID_LEN)?;
    let deleted = store.delete_memory(&p.project_id, &p.memory_id)?;
    if !deleted {
        return Err(ToolError::NotFound("Memory not found".into()));
    }
    Ok(json!({"deleted": true}))
}

// --- Conversations ---

fn create_conversation(
    store: &Store,
    caller: &AuthedAgent,
    p: CreateConversationParams,
) -> Result<Value, ToolError> {
    check_len("project_id", &p.project_id, MAX_ID_LEN)?;
    check_len("title", &p.title, MAX_NAME_LEN)?;
    let conversation = store.create_conversation(
        &p.project_id,
        p.title.trim(),
        p.default_visibility.unwrap_or(Visibility::Team),
        &caller.id,
    )?;
    Ok(json!({"conversation": conversation}))
}

fn list_conversations(store: &Store, p: ListConversationsParams) -> Result<Value, ToolError> {
    check_opt_len("project_id", p.project_id.as_deref(), MAX_ID_LEN)?;
    let conversations = store.list_conversations(p.project_id.as_deref(), p.status)?;
    Ok(json!({"count": conversations.len(), "conversations": conversations}))
}

// --- Subscriptions ---

fn subscribe(store: &Store, caller: &AuthedAgent, p: SubscribeParams) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    let subscription = store.subscribe(
        &p.conversation_id,
        &caller.id,
        p.history_access.unwrap_or(HistoryAccess::Full),
    )?;
    Ok(json!({"subscription": subscription}))
}

fn unsubscribe(
    store: &Store,
    caller: &AuthedAgent,
    p: UnsubscribeParams,
) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    let removed = store.unsubscribe(&p.conversation_id, &caller.id)?;
    Ok(json!({"unsubscribed": removed}))
}

fn list_subscribers(store: &Store, p: ListSubscribersParams) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    let subscribers = store.list_subscribers(&p.conversation_id)?;
    Ok(json!({"count": subscribers.len(), "subscribers": subscribers}))
}

// --- Messages ---

fn send_message(
    store: &Store,
    caller: &AuthedAgent,
    p: SendMessageParams,
) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    check_len("content", &p.content, MAX_MESSAGE_CONTENT)?;
    let message = store.send_message(NewMessage {
        conversation_id: p.conversation_id,
        from_agent: caller.id.clone(),
        content: p.content,
        msg_type: p.msg_type.unwrap_or(MessageType::Message),
        visibility: p.visibility,
        metadata: p.metadata,
    })?;
    Ok(json!({"message": message}))
}

fn get_messages(
    store: &Store,
    caller: &AuthedAgent,
    p: GetMessagesParams,
) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    let messages = store.get_messages(
        &p.conversation_id,
        &caller.id,
        caller.clearance_level,
        &MessageQuery {
            since: p.since,
            unread_only: p.unread_only,
            limit: p.limit,
        },
    )?;
    Ok(json!({"count": messages.len(), "messages": messages}))
}

fn get_status(store: &Store, caller: &AuthedAgent) -> Result<Value, ToolError> {
    let subscriptions = store.list_subscriptions_for_agent(&caller.id)?;
    let mut entries = Vec::new();
    let mut total = 0;
    for sub in subscriptions {
        let title = store
            .get_conversation(&sub.conversation_id)?
            .map(|c| c.title)
            .unwrap_or_default();
        let unread =
            store.unread_count(&sub.conversation_id, &caller.id, caller.clearance_level)?;
        total += unread;
        entries.push(ConversationUnread {
            conversation_id: sub.conversation_id,
            title,
            unread_count: unread,
        });
    }
    let status = StatusResponse {
        agent_id: caller.id.clone(),
        agent_name: caller.name.clone(),
        clearance_level: caller.clearance_level,
        subscriptions: entries,
        total_unread: total,
    };
    Ok(serde_json::to_value(status).map_err(|e| ToolError::Internal(e.to_string()))?)
}

fn mark_read(store: &Store, caller: &AuthedAgent, p: MarkReadParams) -> Result<Value, ToolError> {
    check_len("conversation_id", &p.conversation_id, MAX_ID_LEN)?;
    check_opt_len("up_to_message_id", p.up_to_message_id.as_deref(), MAX_ID_LEN)?;
    let cursor = store.mark_read(
        &p.conversation_id,
        &caller.id,
        p.up_to_message_id.as_deref(),
    )?;
    Ok(json!({"ok": true, "cursor": cursor}))
}

// --- Tool listing ---

/// Schemas for `tools/list`.
pub fn list_tools() -> Value {
    let string = |desc: &str| json!({"type": "string", "description": desc});
    let tools = vec![
        tool_schema(
            "register_agent",
            "Register or update the calling agent's profile",
            json!({
                "type": "object",
                "properties": {
                    "name": string("Agent display name"),
                    "type": string("Free-form agent type"),
                    "capabilities": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["name"]
            }),
        ),
        tool_schema(
            "list_bridge_agents",
            "List agents on the bridge, optionally filtered to a project's participants",
            json!({
                "type": "object",
                "properties": {"project_id": string("Restrict to agents subscribed in this project")}
            }),
        ),
        tool_schema(
            "create_project",
            "Create a project",
            json!({
                "type": "object",
                "properties": {
                    "name": string("Project name"),
                    "description": string("Optional description"),
                    "visibility": visibility_schema(),
                    "confidentiality_mode": {"type": "string", "enum": ["normal", "strict", "flexible"]}
                },
                "required": ["name"]
            }),
        ),
        tool_schema(
            "list_projects",
            "List all projects",
            json!({"type": "object", "properties": {}}),
        ),
        tool_schema(
            "set_memory",
            "Store a project memory note",
            json!({
                "type": "object",
                "properties": {
                    "project_id": string("Project id"),
                    "content": string("Note content"),
                    "key": string("Optional upsert key"),
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "type": string("Note type")
                },
                "required": ["project_id", "content"]
            }),
        ),
        tool_schema(
            "get_memory",
            "Retrieve project memory notes with optional key/tag/type filters",
            json!({
                "type": "object",
                "properties": {
                    "project_id": string("Project id"),
                    "key": string("Filter by key"),
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "type": string("Filter by note type")
                },
                "required": ["project_id"]
            }),
        ),
        tool_schema(
            "delete_memory",
            "Delete a project memory note",
            json!({
                "type": "object",
                "properties": {
                    "project_id": string("Project id"),
                    "memory_id": string("Memory note id")
                },
                "required": ["project_id", "memory_id"]
            }),
        ),
        tool_schema(
            "create_conversation",
            "Create a conversation in a project",
            json!({
                "type": "object",
                "properties": {
                    "project_id": string("Project id"),
                    "title": string("Conversation title"),
                    "default_visibility": visibility_schema()
                },
                "required": ["project_id", "title"]
            }),
        ),
        tool_schema(
            "list_conversations",
            "List conversations, optionally filtered by project and status",
            json!({
                "type": "object",
                "properties": {
                    "project_id": string("Project id"),
                    "status": {"type": "string", "enum": ["active", "closed", "archived"]}
                }
            }),
        ),
        tool_schema(
            "subscribe",
            "Subscribe the caller to a conversation",
            json!({
                "type": "object",
                "properties": {
                    "conversation_id": string("Conversation id"),
                    "history_access": {"type": "string", "enum": ["full", "from_join"]}
                },
                "required": ["conversation_id"]
            }),
        ),
        tool_schema(
            "unsubscribe",
            "Remove the caller's subscription; existing messages are preserved",
            json!({
                "type": "object",
                "properties": {"conversation_id": string("Conversation id")},
                "required": ["conversation_id"]
            }),
        ),
        tool_schema(
            "list_subscribers",
            "List a conversation's subscribers",
            json!({
                "type": "object",
                "properties": {"conversation_id": string("Conversation id")},
                "required": ["conversation_id"]
            }),
        ),
        tool_schema(
            "send_message",
            "Send a message to a conversation as the caller",
            json!({
                "type": "object",
                "properties": {
                    "conversation_id": string("Conversation id"),
                    "content": string("Message body, at most 100 KB"),
                    "type": {"type": "string", "enum": ["message", "spec", "result", "review", "status", "question"]},
                    "visibility": visibility_schema(),
                    "metadata": {"type": "object", "description": "Private metadata; _bridge* keys are stripped"}
                },
                "required": ["conversation_id", "content"]
            }),
        ),
        tool_schema(
            "get_messages",
            "Retrieve visible messages of a conversation",
            json!({
                "type": "object",
                "properties": {
                    "conversation_id": string("Conversation id"),
                    "since": string("Only messages created strictly after this timestamp"),
                    "unread_only": {"type": "boolean", "description": "Only messages past the caller's read cursor"},
                    "limit": {"type": "integer", "description": "Result cap, at most 200"}
                },
                "required": ["conversation_id"]
            }),
        ),
        tool_schema(
            "get_status",
            "Caller identity, subscriptions and unread counts",
            json!({"type": "object", "properties": {}}),
        ),
        tool_schema(
            "mark_read",
            "Advance the caller's read cursor",
            json!({
                "type": "object",
                "properties": {
                    "conversation_id": string("Conversation id"),
                    "up_to_message_id": string("Advance up to this message; defaults to the conversation tail")
                },
                "required": ["conversation_id"]
            }),
        ),
    ];
    json!({"tools": tools})
}

fn tool_schema(name: &str, description: &str, input_schema: Value) -> Value {
    json!({"name": name, "description": description, "inputSchema": input_schema})
}

fn visibility_schema() -> Value {
    json!({"type": "string", "enum": ["public", "team", "confidential", "restricted"]})
}
