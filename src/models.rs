use serde::{Deserialize, Serialize};

// --- Enums ---

/// Four-level clearance/visibility scale, total-ordered low → high.
/// Derived `Ord` follows declaration order, so `Public < Team < Confidential < Restricted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Team,
    Confidential,
    Restricted,
}

impl Visibility {
    /// Integer rank used in SQL visibility filters.
    pub fn rank(self) -> i64 {
        match self {
            Visibility::Public => 0,
            Visibility::Team => 1,
            Visibility::Confidential => 2,
            Visibility::Restricted => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Team => "team",
            Visibility::Confidential => "confidential",
            Visibility::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "team" => Some(Visibility::Team),
            "confidential" => Some(Visibility::Confidential),
            "restricted" => Some(Visibility::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Closed => "closed",
            ConversationStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "closed" => Some(ConversationStatus::Closed),
            "archived" => Some(ConversationStatus::Archived),
            _ => None,
        }
    }

    /// Status only progresses active → closed → archived.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        let order = |s: ConversationStatus| match s {
            ConversationStatus::Active => 0,
            ConversationStatus::Closed => 1,
            ConversationStatus::Archived => 2,
        };
        order(next) >= order(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Message,
    Spec,
    Result,
    Review,
    Status,
    Question,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::Spec => "spec",
            MessageType::Result => "result",
            MessageType::Review => "review",
            MessageType::Status => "status",
            MessageType::Question => "question",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(MessageType::Message),
            "spec" => Some(MessageType::Spec),
            "result" => Some(MessageType::Result),
            "review" => Some(MessageType::Review),
            "status" => Some(MessageType::Status),
            "question" => Some(MessageType::Question),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAccess {
    Full,
    FromJoin,
}

impl HistoryAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAccess::Full => "full",
            HistoryAccess::FromJoin => "from_join",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(HistoryAccess::Full),
            "from_join" => Some(HistoryAccess::FromJoin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidentialityMode {
    Normal,
    Strict,
    Flexible,
}

impl ConfidentialityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfidentialityMode::Normal => "normal",
            ConfidentialityMode::Strict => "strict",
            ConfidentialityMode::Flexible => "flexible",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(ConfidentialityMode::Normal),
            "strict" => Some(ConfidentialityMode::Strict),
            "flexible" => Some(ConfidentialityMode::Flexible),
            _ => None,
        }
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub clearance_level: Visibility,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub api_key_hash: String,
    pub last_seen: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub visibility: Visibility,
    pub confidentiality_mode: ConfidentialityMode,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub default_visibility: Visibility,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub from_agent: String,
    pub content: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub visibility: Visibility,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Subscription {
    pub conversation_id: String,
    pub agent_id: String,
    pub history_access: HistoryAccess,
    pub joined_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReadCursor {
    pub conversation_id: String,
    pub agent_id: String,
    pub last_read_created_at: String,
    pub last_read_message_id: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryNote {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

// --- Store inputs ---

#[derive(Debug, Clone)]
pub struct RegisterAgentSpec {
    pub name: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub clearance_level: Visibility,
    pub api_key_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub from_agent: String,
    pub content: String,
    pub msg_type: MessageType,
    /// Defaults to the conversation's `default_visibility` when absent.
    pub visibility: Option<Visibility>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub since: Option<String>,
    pub unread_only: bool,
    pub limit: Option<i64>,
}

// --- Tool parameters ---

#[derive(Debug, Deserialize)]
pub struct RegisterAgentParams {
    pub name: String,
    #[serde(rename = "type", default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ListBridgeAgentsParams {
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectParams {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub confidentiality_mode: Option<ConfidentialityMode>,
}

#[derive(Debug, Deserialize)]
pub struct SetMemoryParams {
    pub project_id: String,
    pub content: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(rename = "type", default)]
    pub memory_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetMemoryParams {
    pub project_id: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(rename = "type", default)]
    pub memory_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMemoryParams {
    pub project_id: String,
    pub memory_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationParams {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub default_visibility: Option<Visibility>,
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsParams {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    pub conversation_id: String,
    #[serde(default)]
    pub history_access: Option<HistoryAccess>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeParams {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ListSubscribersParams {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageParams {
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub msg_type: Option<MessageType>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesParams {
    pub conversation_id: String,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadParams {
    pub conversation_id: String,
    #[serde(default)]
    pub up_to_message_id: Option<String>,
}

// --- Tool responses ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationUnread {
    pub conversation_id: String,
    pub title: String,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub agent_id: String,
    pub agent_name: String,
    pub clearance_level: Visibility,
    pub subscriptions: Vec<ConversationUnread>,
    pub total_unread: i64,
}
