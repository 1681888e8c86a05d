use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{RegisterAgentSpec, Visibility};
use crate::store::{Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

fn hash_with(salt: Option<&str>, key: &str) -> String {
    match salt {
        Some(salt) => {
            let mut mac =
                HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC accepts any key length");
            mac.update(key.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => {
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing API key")]
    Missing,
    #[error("Invalid API key")]
    Invalid,
    #[error("Auth storage error: {0}")]
    Store(#[from] StoreError),
}

/// One configured bearer key and the identity it maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: String,
    pub name: String,
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_clearance")]
    pub clearance_level: Visibility,
}

fn default_agent_type() -> String {
    "agent".to_string()
}

fn default_clearance() -> Visibility {
    Visibility::Team
}

/// Keyfile shape: `{"salt": "...", "keys": [{"key": "...", "name": "..."}]}`.
#[derive(Debug, Deserialize)]
pub struct KeyFile {
    #[serde(default)]
    pub salt: Option<String>,
    pub keys: Vec<KeyEntry>,
}

/// Identity attached to an authenticated session or loop.
#[derive(Debug, Clone)]
pub struct AuthedAgent {
    pub id: String,
    pub name: String,
    pub clearance_level: Visibility,
}

/// Maps bearer tokens to agent identities. Keys live only as hashes; the
/// hash → entry map is built at construction and immutable afterwards, so
/// token comparison is a plain map lookup.
pub struct AuthProvider {
    salt: Option<String>,
    keys: HashMap<String, KeyEntry>,
}

impl AuthProvider {
    pub fn new(salt: Option<String>, entries: Vec<KeyEntry>) -> Self {
        if salt.is_none() {
            eprintln!("⚠️  No auth salt configured; API keys hashed with bare SHA-256");
        }
        let keys = entries
            .into_iter()
            .map(|e| (hash_with(salt.as_deref(), &e.key), e))
            .collect();
        AuthProvider { salt, keys }
    }

    pub fn from_keyfile(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read keyfile {path}: {e}"))?;
        let file: KeyFile =
            serde_json::from_str(&raw).map_err(|e| format!("Invalid keyfile {path}: {e}"))?;
        Ok(Self::new(file.salt, file.keys))
    }

    /// HMAC-SHA-256(salt, key) when a salt is configured, bare SHA-256
    /// otherwise. Hex-encoded.
    pub fn hash_key(&self, key: &str) -> String {
        hash_with(self.salt.as_deref(), key)
    }

    /// Authenticate a bearer token. A known hash with no agent row yet is
    /// auto-registered from its key entry; an existing row only gets its
    /// `last_seen` touched, so names set through `register_agent` stick.
    pub fn authenticate(
        &self,
        store: &Store,
        token: Option<&str>,
    ) -> Result<AuthedAgent, AuthError> {
        let token = match token {
            Some(t) if !t.trim().is_empty() => t.trim(),
            _ => return Err(AuthError::Missing),
        };
        let hash = self.hash_key(token);
        let entry = self.keys.get(&hash).ok_or(AuthError::Invalid)?;
        let agent = match store.get_agent_by_key_hash(&hash)? {
            Some(existing) => {
                store.update_agent_last_seen(&existing.id)?;
                existing
            }
            None => store.register_agent(&RegisterAgentSpec {
                name: entry.name.clone(),
                agent_type: entry.agent_type.clone(),
                capabilities: entry.capabilities.clone(),
                clearance_level: entry.clearance_level,
                api_key_hash: hash,
            })?,
        };
        Ok(AuthedAgent {
            id: agent.id,
            name: agent.name,
            clearance_level: agent.clearance_level,
        })
    }
}
