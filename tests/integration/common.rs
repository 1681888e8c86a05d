use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use serde_json::{Value, json};

use agorai::auth::{AuthProvider, KeyEntry};
use agorai::models::Visibility;

// Test identities with distinct clearances.
pub const ALICE_KEY: &str = "alice-key"; // team
pub const BOB_KEY: &str = "bob-key"; // confidential
pub const CAROL_KEY: &str = "carol-key"; // public

/// Wrapper around Client that auto-deletes the temp DB on drop.
/// Uses Option<Client> so we can drop the DB connection before deleting the file.
pub struct TestClient {
    client: Option<Client>,
    db_path: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        // Drop client first to release the SQLite connection (WAL mode holds the file)
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

pub fn test_auth() -> AuthProvider {
    AuthProvider::new(
        Some("test-salt".to_string()),
        vec![
            KeyEntry {
                key: ALICE_KEY.to_string(),
                name: "alice".to_string(),
                agent_type: "agent".to_string(),
                capabilities: vec![],
                clearance_level: Visibility::Team,
            },
            KeyEntry {
                key: BOB_KEY.to_string(),
                name: "bob".to_string(),
                agent_type: "agent".to_string(),
                capabilities: vec!["review".to_string()],
                clearance_level: Visibility::Confidential,
            },
            KeyEntry {
                key: CAROL_KEY.to_string(),
                name: "carol".to_string(),
                agent_type: "human".to_string(),
                capabilities: vec![],
                clearance_level: Visibility::Public,
            },
        ],
    )
}

pub fn temp_db_path() -> String {
    format!(
        "/tmp/agorai_test_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

pub fn test_client() -> TestClient {
    // Unique temp DB for each test (avoids parallel test contention)
    let db_path = temp_db_path();
    let rocket = agorai::rocket_with_auth(&db_path, test_auth());
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
    }
}

// --- JSON-RPC helpers ---

/// POST a JSON-RPC body; returns (status, echoed session id, parsed body).
pub fn rpc_post(
    client: &Client,
    token: &str,
    sid: Option<&str>,
    body: Value,
) -> (Status, Option<String>, Value) {
    let mut req = client
        .post("/mcp")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", format!("Bearer {token}")))
        .header(Header::new("Accept", "application/json, text/event-stream"))
        .body(body.to_string());
    if let Some(sid) = sid {
        req = req.header(Header::new("mcp-session-id", sid.to_string()));
    }
    let res = req.dispatch();
    let status = res.status();
    let echoed = res
        .headers()
        .get_one("mcp-session-id")
        .map(|s| s.to_string());
    let parsed: Value = res
        .into_string()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null);
    (status, echoed, parsed)
}

/// Run `initialize` + `notifications/initialized` and return the session id.
pub fn open_session(client: &Client, token: &str) -> String {
    let (status, sid, body) = rpc_post(
        client,
        token,
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "clientInfo": {"name": "test"}, "capabilities": {}}
        }),
    );
    assert_eq!(status, Status::Ok);
    assert!(body["result"]["protocolVersion"].is_string());
    let sid = sid.expect("initialize echoes mcp-session-id");
    let (status, _, _) = rpc_post(
        client,
        token,
        Some(&sid),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized", "params": {}}),
    );
    assert_eq!(status, Status::Accepted);
    sid
}

/// Call a tool; Ok(result) or Err((code, message)).
pub fn call_tool(
    client: &Client,
    token: &str,
    sid: &str,
    name: &str,
    args: Value,
) -> Result<Value, (i64, String)> {
    let (status, _, body) = rpc_post(
        client,
        token,
        Some(sid),
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": name, "arguments": args}
        }),
    );
    assert_eq!(status, Status::Ok, "unexpected transport status: {body}");
    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
        return Err((
            err["code"].as_i64().unwrap_or(0),
            err["message"].as_str().unwrap_or("").to_string(),
        ));
    }
    Ok(body["result"].clone())
}

pub fn create_project(client: &Client, token: &str, sid: &str, name: &str) -> String {
    let result = call_tool(client, token, sid, "create_project", json!({"name": name}))
        .expect("create_project succeeds");
    result["project"]["id"].as_str().unwrap().to_string()
}

pub fn create_conversation(
    client: &Client,
    token: &str,
    sid: &str,
    project_id: &str,
    title: &str,
) -> String {
    let result = call_tool(
        client,
        token,
        sid,
        "create_conversation",
        json!({"project_id": project_id, "title": title}),
    )
    .expect("create_conversation succeeds");
    result["conversation"]["id"].as_str().unwrap().to_string()
}

pub fn send_message(
    client: &Client,
    token: &str,
    sid: &str,
    conversation_id: &str,
    content: &str,
) -> Value {
    call_tool(
        client,
        token,
        sid,
        "send_message",
        json!({"conversation_id": conversation_id, "content": content}),
    )
    .expect("send_message succeeds")["message"]
        .clone()
}

pub fn subscribe(client: &Client, token: &str, sid: &str, conversation_id: &str) {
    call_tool(
        client,
        token,
        sid,
        "subscribe",
        json!({"conversation_id": conversation_id}),
    )
    .expect("subscribe succeeds");
}
