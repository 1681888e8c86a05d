use rusqlite::{Connection, params};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::events::{BridgeEvent, EventBus};
use crate::models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Not subscribed to conversation")]
    NotSubscribed,
    #[error("{0}")]
    Invalid(String),
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Durable record of agents, projects, conversations, messages, subscriptions
/// and per-subscriber read cursors. Single writer over one SQLite handle; all
/// mutation goes through this type.
pub struct Store {
    pub conn: Mutex<Connection>,
    events: EventBus,
}

/// Current time as a fixed-width RFC 3339 string (microseconds, Z suffix) so
/// lexicographic order matches chronological order for cursor comparisons.
pub fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Remove reserved `_bridge*` keys from message metadata.
fn strip_reserved_metadata(metadata: serde_json::Value) -> serde_json::Value {
    match metadata {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(k, _)| !k.starts_with("_bridge"))
                .collect(),
        ),
        other => other,
    }
}

impl Store {
    pub fn new(path: &str, events: EventBus) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let store = Store {
            conn: Mutex::new(conn),
            events,
        };
        store.migrate();
        store
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn migrate(&self) {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                agent_type TEXT NOT NULL DEFAULT 'agent',
                capabilities TEXT NOT NULL DEFAULT '[]',
                clearance_level TEXT NOT NULL DEFAULT 'team',
                api_key_hash TEXT NOT NULL UNIQUE,
                last_seen TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                visibility TEXT NOT NULL DEFAULT 'team',
                confidentiality_mode TEXT NOT NULL DEFAULT 'normal',
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                default_visibility TEXT NOT NULL DEFAULT 'team',
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                from_agent TEXT NOT NULL,
                content TEXT NOT NULL,
                msg_type TEXT NOT NULL DEFAULT 'message',
                visibility TEXT NOT NULL DEFAULT 'team',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conv_created ON messages(conversation_id, created_at, id);
            CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_agent);

            CREATE TABLE IF NOT EXISTS subscriptions (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                agent_id TEXT NOT NULL REFERENCES agents(id),
                history_access TEXT NOT NULL DEFAULT 'full',
                joined_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, agent_id)
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_agent ON subscriptions(agent_id);

            CREATE TABLE IF NOT EXISTS read_cursors (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                agent_id TEXT NOT NULL,
                last_read_created_at TEXT NOT NULL,
                last_read_message_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                key TEXT,
                content TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                memory_type TEXT NOT NULL DEFAULT 'note',
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project_id);",
        )
        .expect("Failed to run migrations");

        // Seed a default project so first-time agents have somewhere to talk
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE name = 'general'",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if count == 0 {
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO projects (id, name, description, visibility, confidentiality_mode, created_by, created_at)
                 VALUES (?1, 'general', 'Default shared project', 'public', 'normal', 'system', ?2)",
                params![uuid::Uuid::new_v4().to_string(), &now],
            )
            .ok();
        }
    }

    // --- Agents ---

    /// Upsert by `api_key_hash`: a known hash updates the existing row and
    /// keeps its id; an unknown hash inserts with a fresh id.
    pub fn register_agent(&self, spec: &RegisterAgentSpec) -> Result<Agent, StoreError> {
        let conn = self.conn();
        let now = now_rfc3339();
        let caps = serde_json::to_string(&spec.capabilities).unwrap_or_else(|_| "[]".into());
        let updated = conn.execute(
            "UPDATE agents SET name = ?1, agent_type = ?2, capabilities = ?3, clearance_level = ?4, last_seen = ?5
             WHERE api_key_hash = ?6",
            params![
                &spec.name,
                &spec.agent_type,
                &caps,
                spec.clearance_level.as_str(),
                &now,
                &spec.api_key_hash
            ],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO agents (id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    &spec.name,
                    &spec.agent_type,
                    &caps,
                    spec.clearance_level.as_str(),
                    &spec.api_key_hash,
                    &now
                ],
            )?;
        }
        conn.query_row(
            "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
             FROM agents WHERE api_key_hash = ?1",
            params![&spec.api_key_hash],
            row_to_agent,
        )
        .map_err(StoreError::from)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.conn();
        match conn.query_row(
            "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
             FROM agents WHERE id = ?1",
            params![id],
            row_to_agent,
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_agent_by_key_hash(&self, hash: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.conn();
        match conn.query_row(
            "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
             FROM agents WHERE api_key_hash = ?1",
            params![hash],
            row_to_agent,
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_agent_last_seen(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE agents SET last_seen = ?1 WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Re-registration through the tool surface: updates the profile fields
    /// but never the clearance (that comes from the key configuration).
    pub fn update_agent_profile(
        &self,
        id: &str,
        name: &str,
        agent_type: &str,
        capabilities: &[String],
    ) -> Result<Agent, StoreError> {
        let conn = self.conn();
        let caps = serde_json::to_string(capabilities).unwrap_or_else(|_| "[]".into());
        let updated = conn.execute(
            "UPDATE agents SET name = ?1, agent_type = ?2, capabilities = ?3, last_seen = ?4 WHERE id = ?5",
            params![name, agent_type, &caps, now_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound("Agent"));
        }
        conn.query_row(
            "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
             FROM agents WHERE id = ?1",
            params![id],
            row_to_agent,
        )
        .map_err(StoreError::from)
    }

    /// All agents, optionally restricted to those subscribed to any
    /// conversation of the given project.
    pub fn list_agents(&self, project_id: Option<&str>) -> Result<Vec<Agent>, StoreError> {
        let conn = self.conn();
        let mut agents = Vec::new();
        if let Some(pid) = project_id {
            if !project_exists(&conn, pid)? {
                return Err(StoreError::NotFound("Project"));
            }
            let mut stmt = conn.prepare(
                "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
                 FROM agents WHERE id IN (
                     SELECT DISTINCT s.agent_id FROM subscriptions s
                     JOIN conversations c ON c.id = s.conversation_id
                     WHERE c.project_id = ?1
                 ) ORDER BY name",
            )?;
            let rows = stmt.query_map(params![pid], row_to_agent)?;
            for row in rows {
                agents.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, name, agent_type, capabilities, clearance_level, api_key_hash, last_seen
                 FROM agents ORDER BY name",
            )?;
            let rows = stmt.query_map([], row_to_agent)?;
            for row in rows {
                agents.push(row?);
            }
        }
        Ok(agents)
    }

    // --- Projects ---

    pub fn create_project(
        &self,
        name: &str,
        description: Option<&str>,
        visibility: Visibility,
        confidentiality_mode: ConfidentialityMode,
        created_by: &str,
    ) -> Result<Project, StoreError> {
        let conn = self.conn();
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO projects (id, name, description, visibility, confidentiality_mode, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &id,
                name,
                description,
                visibility.as_str(),
                confidentiality_mode.as_str(),
                created_by,
                &now
            ],
        )?;
        Ok(Project {
            id,
            name: name.to_string(),
            description: description.map(String::from),
            visibility,
            confidentiality_mode,
            created_by: created_by.to_string(),
            created_at: now,
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, visibility, confidentiality_mode, created_by, created_at
             FROM projects ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    // --- Conversations ---

    pub fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
        default_visibility: Visibility,
        created_by: &str,
    ) -> Result<Conversation, StoreError> {
        let conn = self.conn();
        if !project_exists(&conn, project_id)? {
            return Err(StoreError::NotFound("Project"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO conversations (id, project_id, title, status, default_visibility, created_by, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
            params![&id, project_id, title, default_visibility.as_str(), created_by, &now],
        )?;
        Ok(Conversation {
            id,
            project_id: project_id.to_string(),
            title: title.to_string(),
            status: ConversationStatus::Active,
            default_visibility,
            created_by: created_by.to_string(),
            created_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn();
        match conn.query_row(
            "SELECT id, project_id, title, status, default_visibility, created_by, created_at
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_conversations(
        &self,
        project_id: Option<&str>,
        status: Option<ConversationStatus>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn();
        let mut sql = String::from(
            "SELECT id, project_id, title, status, default_visibility, created_by, created_at
             FROM conversations WHERE 1=1",
        );
        let mut param_values: Vec<String> = Vec::new();
        let mut idx = 1;
        if let Some(pid) = project_id {
            if !project_exists(&conn, pid)? {
                return Err(StoreError::NotFound("Project"));
            }
            sql.push_str(&format!(" AND project_id = ?{idx}"));
            param_values.push(pid.to_string());
            idx += 1;
        }
        if let Some(st) = status {
            sql.push_str(&format!(" AND status = ?{idx}"));
            param_values.push(st.as_str().to_string());
        }
        sql.push_str(" ORDER BY created_at, id");
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(|v| v as &dyn rusqlite::types::ToSql)
            .collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_conversation)?;
        let mut convs = Vec::new();
        for row in rows {
            convs.push(row?);
        }
        Ok(convs)
    }

    /// Status progresses active → closed → archived and never back.
    pub fn update_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        let conn = self.conn();
        let current: String = conn
            .query_row(
                "SELECT status FROM conversations WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(|_| StoreError::NotFound("Conversation"))?;
        let current = ConversationStatus::parse(&current)
            .ok_or_else(|| StoreError::Invalid(format!("Unknown status '{current}'")))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::Invalid(format!(
                "Conversation status cannot move from {} to {}",
                current.as_str(),
                status.as_str()
            )));
        }
        conn.execute(
            "UPDATE conversations SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        conn.query_row(
            "SELECT id, project_id, title, status, default_visibility, created_by, created_at
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .map_err(StoreError::from)
    }

    // --- Subscriptions ---

    pub fn subscribe(
        &self,
        conversation_id: &str,
        agent_id: &str,
        history_access: HistoryAccess,
    ) -> Result<Subscription, StoreError> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(StoreError::NotFound("Conversation"));
        }
        let now = now_rfc3339();
        // At most one subscription per (conversation, agent) pair
        conn.execute(
            "INSERT INTO subscriptions (conversation_id, agent_id, history_access, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id, agent_id) DO NOTHING",
            params![conversation_id, agent_id, history_access.as_str(), &now],
        )?;
        conn.query_row(
            "SELECT conversation_id, agent_id, history_access, joined_at
             FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
            row_to_subscription,
        )
        .map_err(StoreError::from)
    }

    /// Deleting a subscription preserves existing messages.
    pub fn unsubscribe(&self, conversation_id: &str, agent_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(StoreError::NotFound("Conversation"));
        }
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn is_subscribed(&self, conversation_id: &str, agent_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_subscription(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let conn = self.conn();
        match conn.query_row(
            "SELECT conversation_id, agent_id, history_access, joined_at
             FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
            row_to_subscription,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_subscribers(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(StoreError::NotFound("Conversation"));
        }
        let mut stmt = conn.prepare(
            "SELECT conversation_id, agent_id, history_access, joined_at
             FROM subscriptions WHERE conversation_id = ?1 ORDER BY joined_at, agent_id",
        )?;
        let rows = stmt.query_map(params![conversation_id], row_to_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    pub fn list_subscriptions_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, agent_id, history_access, joined_at
             FROM subscriptions WHERE agent_id = ?1 ORDER BY joined_at, conversation_id",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_subscription)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    // --- Messages ---

    /// Assigns id and created_at, writes atomically, then emits
    /// `message:created` after the write is durable. A failed emit never
    /// rolls back the write.
    pub fn send_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let content = new.content.trim().to_string();
        if content.is_empty() {
            return Err(StoreError::Invalid("Message content must not be empty".into()));
        }
        let metadata = strip_reserved_metadata(new.metadata.unwrap_or(serde_json::json!({})));
        let msg = {
            let conn = self.conn();
            let default_visibility: String = match conn.query_row(
                "SELECT default_visibility FROM conversations WHERE id = ?1",
                params![&new.conversation_id],
                |r| r.get(0),
            ) {
                Ok(v) => v,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(StoreError::NotFound("Conversation"));
                }
                Err(e) => return Err(e.into()),
            };
            let visibility = new.visibility.unwrap_or_else(|| {
                Visibility::parse(&default_visibility).unwrap_or(Visibility::Team)
            });
            let subscribed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
                params![&new.conversation_id, &new.from_agent],
                |r| r.get(0),
            )?;
            if subscribed == 0 {
                return Err(StoreError::NotSubscribed);
            }
            let id = uuid::Uuid::new_v4().to_string();
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO messages (id, conversation_id, from_agent, content, msg_type, visibility, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &id,
                    &new.conversation_id,
                    &new.from_agent,
                    &content,
                    new.msg_type.as_str(),
                    visibility.as_str(),
                    serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".into()),
                    &now
                ],
            )?;
            Message {
                id,
                conversation_id: new.conversation_id,
                from_agent: new.from_agent,
                content,
                msg_type: new.msg_type,
                visibility,
                metadata,
                created_at: now,
            }
        };
        // Emitted after the lock is released and the row is durable
        self.events.publish(BridgeEvent::MessageCreated(msg.clone()));
        Ok(msg)
    }

    /// Messages of a conversation visible to the viewer, ascending by
    /// `(created_at, id)`.
    ///
    /// A `from_join` subscription floors the no-`since` query at the join
    /// time; an explicit `since` is honored verbatim. `unread_only` restricts
    /// to messages strictly after the viewer's cursor that the viewer did not
    /// author.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        clearance: Visibility,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(StoreError::NotFound("Conversation"));
        }
        let subscription = match conn.query_row(
            "SELECT conversation_id, agent_id, history_access, joined_at
             FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, viewer_id],
            row_to_subscription,
        ) {
            Ok(s) => s,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(StoreError::NotSubscribed),
            Err(e) => return Err(e.into()),
        };

        let mut sql = String::from(
            "SELECT id, conversation_id, from_agent, content, msg_type, visibility, metadata, created_at
             FROM messages WHERE conversation_id = ?1",
        );
        let mut param_values: Vec<String> = vec![conversation_id.to_string()];
        let mut idx = 2;

        // Visibility: clearance rank covers it, or the viewer authored it
        sql.push_str(&format!(
            " AND (from_agent = ?{idx} OR {VISIBILITY_RANK_SQL} <= ?{})",
            idx + 1
        ));
        param_values.push(viewer_id.to_string());
        param_values.push(clearance.rank().to_string());
        idx += 2;

        if let Some(since) = &query.since {
            sql.push_str(&format!(" AND created_at > ?{idx}"));
            param_values.push(since.clone());
            idx += 1;
        } else if subscription.history_access == HistoryAccess::FromJoin {
            sql.push_str(&format!(" AND created_at >= ?{idx}"));
            param_values.push(subscription.joined_at.clone());
            idx += 1;
        }

        if query.unread_only {
            sql.push_str(&format!(" AND from_agent != ?{idx}"));
            param_values.push(viewer_id.to_string());
            idx += 1;
            let cursor = read_cursor(&conn, conversation_id, viewer_id)?;
            if let Some(c) = cursor {
                sql.push_str(&format!(
                    " AND (created_at > ?{idx} OR (created_at = ?{idx} AND id > ?{}))",
                    idx + 1
                ));
                param_values.push(c.last_read_created_at);
                param_values.push(c.last_read_message_id);
                idx += 2;
            }
        }

        let limit = query.limit.unwrap_or(MESSAGE_LIMIT_CEILING).clamp(1, MESSAGE_LIMIT_CEILING);
        sql.push_str(&format!(" ORDER BY created_at ASC, id ASC LIMIT ?{idx}"));
        param_values.push(limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(|v| v as &dyn rusqlite::types::ToSql)
            .collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Unread-message count for the status report; same filters as
    /// `get_messages` with `unread_only`.
    pub fn unread_count(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        clearance: Visibility,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        let cursor = read_cursor(&conn, conversation_id, viewer_id)?;
        let (cursor_at, cursor_id) = match &cursor {
            Some(c) => (c.last_read_created_at.clone(), c.last_read_message_id.clone()),
            // Sorts before every real timestamp, so no cursor means everything is unread
            None => (String::new(), String::new()),
        };
        // The viewer's own messages are never unread, so authorship cannot
        // widen visibility here
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1
                   AND from_agent != ?2
                   AND {VISIBILITY_RANK_SQL} <= ?3
                   AND (created_at > ?4 OR (created_at = ?4 AND id > ?5))"
            ),
            params![conversation_id, viewer_id, clearance.rank(), cursor_at, cursor_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Advance the viewer's read cursor to `up_to_message_id` when given (it
    /// must belong to the conversation), else to the conversation tail.
    /// Idempotent and monotonic: an earlier position than the current cursor
    /// is a no-op.
    pub fn mark_read(
        &self,
        conversation_id: &str,
        agent_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<Option<ReadCursor>, StoreError> {
        let conn = self.conn();
        if !conversation_exists(&conn, conversation_id)? {
            return Err(StoreError::NotFound("Conversation"));
        }
        let subscribed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE conversation_id = ?1 AND agent_id = ?2",
            params![conversation_id, agent_id],
            |r| r.get(0),
        )?;
        if subscribed == 0 {
            return Err(StoreError::NotSubscribed);
        }

        let target: Option<(String, String)> = if let Some(mid) = up_to_message_id {
            match conn.query_row(
                "SELECT created_at, id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![mid, conversation_id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            ) {
                Ok(pair) => Some(pair),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(StoreError::NotFound("Message"));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            match conn.query_row(
                "SELECT created_at, id FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![conversation_id],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            ) {
                Ok(pair) => Some(pair),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some((created_at, message_id)) = target {
            // UPSERT that never rewinds the (created_at, id) position
            conn.execute(
                "INSERT INTO read_cursors (conversation_id, agent_id, last_read_created_at, last_read_message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(conversation_id, agent_id) DO UPDATE SET
                   last_read_created_at = excluded.last_read_created_at,
                   last_read_message_id = excluded.last_read_message_id,
                   updated_at = excluded.updated_at
                 WHERE excluded.last_read_created_at > read_cursors.last_read_created_at
                    OR (excluded.last_read_created_at = read_cursors.last_read_created_at
                        AND excluded.last_read_message_id > read_cursors.last_read_message_id)",
                params![conversation_id, agent_id, &created_at, &message_id, now_rfc3339()],
            )?;
        }

        read_cursor(&conn, conversation_id, agent_id)
    }

    // --- Project memory ---

    pub fn set_memory(
        &self,
        project_id: &str,
        content: &str,
        key: Option<&str>,
        tags: &[String],
        memory_type: &str,
        created_by: &str,
    ) -> Result<MemoryNote, StoreError> {
        let conn = self.conn();
        if !project_exists(&conn, project_id)? {
            return Err(StoreError::NotFound("Project"));
        }
        let now = now_rfc3339();
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".into());
        let existing: Option<String> = match key {
            Some(k) => match conn.query_row(
                "SELECT id FROM memories WHERE project_id = ?1 AND key = ?2",
                params![project_id, k],
                |r| r.get(0),
            ) {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE memories SET content = ?1, tags = ?2, memory_type = ?3, updated_at = ?4 WHERE id = ?5",
                    params![content, &tags_json, memory_type, &now, &id],
                )?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO memories (id, project_id, key, content, tags, memory_type, created_by, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![&id, project_id, key, content, &tags_json, memory_type, created_by, &now, &now],
                )?;
                id
            }
        };
        conn.query_row(
            "SELECT id, project_id, key, content, tags, memory_type, created_by, created_at, updated_at
             FROM memories WHERE id = ?1",
            params![&id],
            row_to_memory,
        )
        .map_err(StoreError::from)
    }

    pub fn get_memory(
        &self,
        project_id: &str,
        key: Option<&str>,
        tags: Option<&[String]>,
        memory_type: Option<&str>,
    ) -> Result<Vec<MemoryNote>, StoreError> {
        let conn = self.conn();
        if !project_exists(&conn, project_id)? {
            return Err(StoreError::NotFound("Project"));
        }
        let mut sql = String::from(
            "SELECT id, project_id, key, content, tags, memory_type, created_by, created_at, updated_at
             FROM memories WHERE project_id = ?1",
        );
        let mut param_values: Vec<String> = vec![project_id.to_string()];
        let mut idx = 2;
        if let Some(k) = key {
            sql.push_str(&format!(" AND key = ?{idx}"));
            param_values.push(k.to_string());
            idx += 1;
        }
        if let Some(t) = memory_type {
            sql.push_str(&format!(" AND memory_type = ?{idx}"));
            param_values.push(t.to_string());
        }
        sql.push_str(" ORDER BY updated_at DESC, id");
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(|v| v as &dyn rusqlite::types::ToSql)
            .collect();
        let rows = stmt.query_map(params_refs.as_slice(), row_to_memory)?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row?);
        }
        // Tag filter on the decoded JSON array (any requested tag matches)
        if let Some(wanted) = tags {
            if !wanted.is_empty() {
                notes.retain(|n| n.tags.iter().any(|t| wanted.contains(t)));
            }
        }
        Ok(notes)
    }

    pub fn delete_memory(&self, project_id: &str, memory_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        if !project_exists(&conn, project_id)? {
            return Err(StoreError::NotFound("Project"));
        }
        let deleted = conn.execute(
            "DELETE FROM memories WHERE id = ?1 AND project_id = ?2",
            params![memory_id, project_id],
        )?;
        Ok(deleted > 0)
    }
}

/// Safety ceiling on message listings.
pub const MESSAGE_LIMIT_CEILING: i64 = 200;

/// SQL expression mapping a stored visibility string to its rank.
const VISIBILITY_RANK_SQL: &str = "CASE visibility
    WHEN 'public' THEN 0
    WHEN 'team' THEN 1
    WHEN 'confidential' THEN 2
    WHEN 'restricted' THEN 3
    ELSE 3 END";

fn project_exists(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM projects WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn conversation_exists(conn: &Connection, id: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE id = ?1",
        params![id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn read_cursor(
    conn: &Connection,
    conversation_id: &str,
    agent_id: &str,
) -> Result<Option<ReadCursor>, StoreError> {
    match conn.query_row(
        "SELECT conversation_id, agent_id, last_read_created_at, last_read_message_id, updated_at
         FROM read_cursors WHERE conversation_id = ?1 AND agent_id = ?2",
        params![conversation_id, agent_id],
        |row| {
            Ok(ReadCursor {
                conversation_id: row.get(0)?,
                agent_id: row.get(1)?,
                last_read_created_at: row.get(2)?,
                last_read_message_id: row.get(3)?,
                updated_at: row.get(4)?,
            })
        },
    ) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// --- Row mappers ---

fn row_to_agent(row: &rusqlite::Row<'_>) -> Result<Agent, rusqlite::Error> {
    let caps_str: String = row.get(3)?;
    let clearance: String = row.get(4)?;
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        agent_type: row.get(2)?,
        capabilities: serde_json::from_str(&caps_str).unwrap_or_default(),
        clearance_level: Visibility::parse(&clearance).unwrap_or(Visibility::Team),
        api_key_hash: row.get(5)?,
        last_seen: row.get(6)?,
    })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<Project, rusqlite::Error> {
    let visibility: String = row.get(3)?;
    let mode: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Team),
        confidentiality_mode: ConfidentialityMode::parse(&mode)
            .unwrap_or(ConfidentialityMode::Normal),
        created_by: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, rusqlite::Error> {
    let status: String = row.get(3)?;
    let visibility: String = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
        default_visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Team),
        created_by: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, rusqlite::Error> {
    let msg_type: String = row.get(4)?;
    let visibility: String = row.get(5)?;
    let metadata_str: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        from_agent: row.get(2)?,
        content: row.get(3)?,
        msg_type: MessageType::parse(&msg_type).unwrap_or(MessageType::Message),
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Team),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
        created_at: row.get(7)?,
    })
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> Result<Subscription, rusqlite::Error> {
    let access: String = row.get(2)?;
    Ok(Subscription {
        conversation_id: row.get(0)?,
        agent_id: row.get(1)?,
        history_access: HistoryAccess::parse(&access).unwrap_or(HistoryAccess::Full),
        joined_at: row.get(3)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> Result<MemoryNote, rusqlite::Error> {
    let tags_str: String = row.get(4)?;
    Ok(MemoryNote {
        id: row.get(0)?,
        project_id: row.get(1)?,
        key: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        memory_type: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
