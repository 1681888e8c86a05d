use rocket::http::{ContentType, Header, Status};
use serde_json::json;

use crate::common::{ALICE_KEY, call_tool, open_session, rpc_post, test_client};

#[test]
fn test_initialize_returns_session_id_and_server_info() {
    let client = test_client();
    let (status, sid, body) = rpc_post(
        &client,
        ALICE_KEY,
        None,
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26"}
        }),
    );
    assert_eq!(status, Status::Ok);
    assert!(sid.is_some());
    assert!(sid.unwrap().starts_with("mcp_"));
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["serverInfo"]["name"], "agorai");
    assert!(body["result"]["capabilities"]["tools"].is_object());
}

#[test]
fn test_missing_token_is_unauthorized() {
    let client = test_client();
    let res = client
        .post("/mcp")
        .header(ContentType::JSON)
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "Missing API key");
}

#[test]
fn test_invalid_token_is_forbidden() {
    let client = test_client();
    let (status, _, body) = rpc_post(
        &client,
        "no-such-key",
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    );
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["error"], "Invalid API key");
}

#[test]
fn test_unknown_session_is_404_session_not_found() {
    let client = test_client();
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some("mcp_doesnotexist"),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["error"], "Session not found");
}

#[test]
fn test_request_before_initialized_notification_is_rejected() {
    let client = test_client();
    // initialize only; skip notifications/initialized
    let (_, sid, _) = rpc_post(
        &client,
        ALICE_KEY,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    );
    let sid = sid.unwrap();
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(body["error"]["message"], "Session not initialized");
}

#[test]
fn test_request_without_session_header_is_bad_request() {
    let client = test_client();
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        None,
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "Missing mcp-session-id header");
}

#[test]
fn test_tools_list_names_all_sixteen_tools() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::Ok);
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 16);
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    for expected in [
        "register_agent",
        "list_bridge_agents",
        "create_project",
        "list_projects",
        "set_memory",
        "get_memory",
        "delete_memory",
        "create_conversation",
        "list_conversations",
        "subscribe",
        "unsubscribe",
        "list_subscribers",
        "send_message",
        "get_messages",
        "get_status",
        "mark_read",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
}

#[test]
fn test_ping() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 4, "method": "ping", "params": {}}),
    );
    assert_eq!(status, Status::Ok);
    assert!(body["result"].is_object());
}

#[test]
fn test_unknown_method_is_method_not_found() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let (_, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 5, "method": "no/such/method", "params": {}}),
    );
    assert_eq!(body["error"]["code"], -32601);
}

#[test]
fn test_wrong_jsonrpc_version_rejected() {
    let client = test_client();
    let (_, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        None,
        json!({"jsonrpc": "1.0", "id": 1, "method": "initialize", "params": {}}),
    );
    assert_eq!(body["error"]["code"], -32600);
}

#[test]
fn test_delete_terminates_session() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);

    let res = client
        .delete("/mcp")
        .header(Header::new("Authorization", format!("Bearer {ALICE_KEY}")))
        .header(Header::new("mcp-session-id", sid.clone()))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // The session is gone now
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&sid),
        json!({"jsonrpc": "2.0", "id": 6, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["error"], "Session not found");
}

#[test]
fn test_delete_unknown_session_is_404() {
    let client = test_client();
    let res = client
        .delete("/mcp")
        .header(Header::new("Authorization", format!("Bearer {ALICE_KEY}")))
        .header(Header::new("mcp-session-id", "mcp_gone"))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

/// A client holding a session id from before a bridge restart gets 404
/// "Session not found", resets, re-initializes and proceeds.
#[test]
fn test_session_recovery_after_restart() {
    let stale_sid;
    {
        let client = test_client();
        stale_sid = open_session(&client, ALICE_KEY);
    }

    // "Restarted" bridge: fresh process state, the old session id is unknown
    let client = test_client();
    let (status, _, body) = rpc_post(
        &client,
        ALICE_KEY,
        Some(&stale_sid),
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}),
    );
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["error"], "Session not found");

    // Reset + re-initialize, then the next request succeeds
    let new_sid = open_session(&client, ALICE_KEY);
    assert_ne!(new_sid, stale_sid);
    let result = call_tool(&client, ALICE_KEY, &new_sid, "list_projects", json!({}));
    assert!(result.is_ok());
}

#[test]
fn test_stream_requires_known_session() {
    let client = test_client();
    let res = client
        .get("/mcp")
        .header(Header::new("Authorization", format!("Bearer {ALICE_KEY}")))
        .header(Header::new("mcp-session-id", "mcp_gone"))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_stream_requires_session_header() {
    let client = test_client();
    let res = client
        .get("/mcp")
        .header(Header::new("Authorization", format!("Bearer {ALICE_KEY}")))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
