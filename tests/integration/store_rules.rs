use agorai::events::EventBus;
use agorai::models::*;
use agorai::store::{Store, StoreError};

use crate::common::temp_db_path;

struct TempStore {
    store: Store,
    db_path: String,
}

impl Drop for TempStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

fn temp_store() -> TempStore {
    let db_path = temp_db_path();
    TempStore {
        store: Store::new(&db_path, EventBus::new()),
        db_path,
    }
}

fn seed(store: &Store) -> (Agent, String) {
    let agent = store
        .register_agent(&RegisterAgentSpec {
            name: "seed".to_string(),
            agent_type: "agent".to_string(),
            capabilities: vec![],
            clearance_level: Visibility::Team,
            api_key_hash: "internal:seed".to_string(),
        })
        .unwrap();
    let project = store
        .create_project("rules-p", None, Visibility::Public, ConfidentialityMode::Normal, &agent.id)
        .unwrap();
    let conv = store
        .create_conversation(&project.id, "rules-c", Visibility::Public, &agent.id)
        .unwrap();
    store
        .subscribe(&conv.id, &agent.id, HistoryAccess::Full)
        .unwrap();
    (agent, conv.id)
}

#[test]
fn test_conversation_status_only_progresses() {
    let ts = temp_store();
    let (agent, _) = seed(&ts.store);
    let project = ts
        .store
        .create_project("status-p", None, Visibility::Public, ConfidentialityMode::Normal, &agent.id)
        .unwrap();
    let conv = ts
        .store
        .create_conversation(&project.id, "status-c", Visibility::Public, &agent.id)
        .unwrap();

    let closed = ts
        .store
        .update_conversation_status(&conv.id, ConversationStatus::Closed)
        .unwrap();
    assert_eq!(closed.status, ConversationStatus::Closed);

    // Reopening is not a thing
    let err = ts
        .store
        .update_conversation_status(&conv.id, ConversationStatus::Active)
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));

    let archived = ts
        .store
        .update_conversation_status(&conv.id, ConversationStatus::Archived)
        .unwrap();
    assert_eq!(archived.status, ConversationStatus::Archived);

    // Same status again is allowed (no regression, no error)
    let archived = ts
        .store
        .update_conversation_status(&conv.id, ConversationStatus::Archived)
        .unwrap();
    assert_eq!(archived.status, ConversationStatus::Archived);
}

#[test]
fn test_empty_content_is_rejected() {
    let ts = temp_store();
    let (agent, conv_id) = seed(&ts.store);
    let err = ts
        .store
        .send_message(NewMessage {
            conversation_id: conv_id,
            from_agent: agent.id,
            content: "   ".to_string(),
            msg_type: MessageType::Message,
            visibility: None,
            metadata: None,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
}

#[test]
fn test_messages_are_ordered_by_created_at_then_id() {
    let ts = temp_store();
    let (agent, conv_id) = seed(&ts.store);
    for i in 0..5 {
        ts.store
            .send_message(NewMessage {
                conversation_id: conv_id.clone(),
                from_agent: agent.id.clone(),
                content: format!("msg {i}"),
                msg_type: MessageType::Message,
                visibility: None,
                metadata: None,
            })
            .unwrap();
    }
    let messages = ts
        .store
        .get_messages(&conv_id, &agent.id, Visibility::Team, &MessageQuery::default())
        .unwrap();
    assert_eq!(messages.len(), 5);
    let mut sorted = messages.clone();
    sorted.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    let got: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let want: Vec<&str> = sorted.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(got, want);
}

#[test]
fn test_register_agent_upserts_by_key_hash() {
    let ts = temp_store();
    let first = ts
        .store
        .register_agent(&RegisterAgentSpec {
            name: "one".to_string(),
            agent_type: "agent".to_string(),
            capabilities: vec![],
            clearance_level: Visibility::Team,
            api_key_hash: "hash-upsert".to_string(),
        })
        .unwrap();
    let second = ts
        .store
        .register_agent(&RegisterAgentSpec {
            name: "renamed".to_string(),
            agent_type: "planner".to_string(),
            capabilities: vec!["plan".to_string()],
            clearance_level: Visibility::Confidential,
            api_key_hash: "hash-upsert".to_string(),
        })
        .unwrap();
    // Same row, updated fields, never a duplicate
    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "renamed");
    assert_eq!(second.clearance_level, Visibility::Confidential);
    assert_eq!(ts.store.list_agents(None).unwrap().len(), 1);
}

#[test]
fn test_get_agent_by_key_hash() {
    let ts = temp_store();
    let (agent, _) = seed(&ts.store);
    let found = ts.store.get_agent_by_key_hash("internal:seed").unwrap();
    assert_eq!(found.unwrap().id, agent.id);
    assert!(ts.store.get_agent_by_key_hash("unknown").unwrap().is_none());
}

#[test]
fn test_update_agent_last_seen_moves_forward() {
    let ts = temp_store();
    let (agent, _) = seed(&ts.store);
    ts.store.update_agent_last_seen(&agent.id).unwrap();
    let after = ts.store.get_agent(&agent.id).unwrap().unwrap();
    assert!(after.last_seen >= agent.last_seen);
}
