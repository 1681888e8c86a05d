use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::auth::AuthedAgent;
use crate::models::Visibility;
use crate::store::now_rfc3339;

/// One authenticated HTTP context, created by `initialize` and torn down by
/// DELETE or server restart.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub clearance_level: Visibility,
    pub initialized: bool,
    pub created_at: String,
}

/// Generate a session id: `mcp_<32 hex chars>`
fn generate_session_id() -> String {
    format!("mcp_{:032x}", uuid::Uuid::new_v4().as_u128())
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session for an authenticated agent. The session starts
    /// Uninitialized; `notifications/initialized` flips it.
    pub fn create(&self, agent: &AuthedAgent) -> Session {
        let session = Session {
            id: generate_session_id(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            clearance_level: agent.clearance_level,
            initialized: false,
            created_at: now_rfc3339(),
        };
        self.inner
            .write()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn mark_initialized(&self, id: &str) -> bool {
        let mut map = self.inner.write().unwrap();
        match map.get_mut(id) {
            Some(s) => {
                s.initialized = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.write().unwrap().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
