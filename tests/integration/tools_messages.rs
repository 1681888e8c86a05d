use serde_json::json;

use crate::common::{
    ALICE_KEY, BOB_KEY, CAROL_KEY, call_tool, create_conversation, create_project, open_session,
    send_message, subscribe, test_client,
};

fn setup_conversation(client: &crate::common::TestClient, sid: &str) -> String {
    let project_id = create_project(client, ALICE_KEY, sid, "msg-project");
    create_conversation(client, ALICE_KEY, sid, &project_id, "msg-conv")
}

#[test]
fn test_send_and_get_messages() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);
    subscribe(&client, ALICE_KEY, &sid, &conv_id);

    let msg = send_message(&client, ALICE_KEY, &sid, &conv_id, "hello world");
    assert_eq!(msg["content"], "hello world");
    assert_eq!(msg["type"], "message");
    assert!(msg["id"].as_str().is_some());
    assert!(msg["created_at"].as_str().is_some());

    let got = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
    assert_eq!(got["messages"][0]["content"], "hello world");
}

#[test]
fn test_send_requires_subscription() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);

    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "hi"}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32002);
    assert!(err.1.contains("Not subscribed"));
}

#[test]
fn test_send_message_unknown_conversation() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({"conversation_id": "missing", "content": "hi"}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32001);
    assert_eq!(err.1, "Conversation not found");
}

#[test]
fn test_message_validation() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);
    subscribe(&client, ALICE_KEY, &sid, &conv_id);

    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": ""}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32602);

    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "x".repeat(100 * 1024 + 1)}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32602);

    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "ok", "type": "sonnet"}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32602);
}

#[test]
fn test_bridge_metadata_keys_are_stripped() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);
    subscribe(&client, ALICE_KEY, &sid, &conv_id);

    let result = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "send_message",
        json!({
            "conversation_id": conv_id,
            "content": "with metadata",
            "metadata": {"_bridge_internal": "nope", "trace_id": "abc"}
        }),
    )
    .unwrap();
    let metadata = &result["message"]["metadata"];
    assert!(metadata.get("_bridge_internal").is_none());
    assert_eq!(metadata["trace_id"], "abc");
}

#[test]
fn test_visibility_filtering() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY); // team
    let bob_sid = open_session(&client, BOB_KEY); // confidential
    let carol_sid = open_session(&client, CAROL_KEY); // public

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);
    subscribe(&client, CAROL_KEY, &carol_sid, &conv_id);

    call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "secret plan", "visibility": "confidential"}),
    )
    .unwrap();
    call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "public notice", "visibility": "public"}),
    )
    .unwrap();

    // Alice (team) sees only the public message
    let got = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
    assert_eq!(got["messages"][0]["content"], "public notice");

    // Carol (public) the same
    let got = call_tool(
        &client,
        CAROL_KEY,
        &carol_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);

    // Bob sees both: clearance covers one, authorship the other
    let got = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 2);
}

#[test]
fn test_sender_always_sees_own_messages() {
    let client = test_client();
    let carol_sid = open_session(&client, CAROL_KEY); // public clearance
    let alice_sid = open_session(&client, ALICE_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, CAROL_KEY, &carol_sid, &conv_id);

    // Carol authors above her own clearance; she must still retrieve it
    call_tool(
        &client,
        CAROL_KEY,
        &carol_sid,
        "send_message",
        json!({"conversation_id": conv_id, "content": "my own secret", "visibility": "restricted"}),
    )
    .unwrap();

    let got = call_tool(
        &client,
        CAROL_KEY,
        &carol_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
    assert_eq!(got["messages"][0]["content"], "my own secret");
}

#[test]
fn test_unread_only_and_mark_read_flow() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);

    send_message(&client, BOB_KEY, &bob_sid, &conv_id, "first");
    let second = send_message(&client, BOB_KEY, &bob_sid, &conv_id, "second");
    send_message(&client, ALICE_KEY, &alice_sid, &conv_id, "alice talks");

    // Alice's unread excludes her own message
    let got = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "get_messages",
        json!({"conversation_id": conv_id, "unread_only": true}),
    )
    .unwrap();
    assert_eq!(got["count"], 2);
    assert_eq!(got["messages"][0]["content"], "first");
    assert_eq!(got["messages"][1]["content"], "second");

    // Mark read up to the second message
    let marked = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "mark_read",
        json!({"conversation_id": conv_id, "up_to_message_id": second["id"]}),
    )
    .unwrap();
    assert_eq!(marked["ok"], true);
    assert_eq!(marked["cursor"]["last_read_message_id"], second["id"]);

    let got = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "get_messages",
        json!({"conversation_id": conv_id, "unread_only": true}),
    )
    .unwrap();
    assert_eq!(got["count"], 0);

    // A later message becomes unread again
    send_message(&client, BOB_KEY, &bob_sid, &conv_id, "third");
    let got = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "get_messages",
        json!({"conversation_id": conv_id, "unread_only": true}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
    assert_eq!(got["messages"][0]["content"], "third");
}

#[test]
fn test_mark_read_is_monotonic_and_idempotent() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);

    let first = send_message(&client, BOB_KEY, &bob_sid, &conv_id, "m1");
    let second = send_message(&client, BOB_KEY, &bob_sid, &conv_id, "m2");

    call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "mark_read",
        json!({"conversation_id": conv_id, "up_to_message_id": second["id"]}),
    )
    .unwrap();

    // Rewinding to the first message is a no-op
    let marked = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "mark_read",
        json!({"conversation_id": conv_id, "up_to_message_id": first["id"]}),
    )
    .unwrap();
    assert_eq!(marked["cursor"]["last_read_message_id"], second["id"]);

    // Repeating the same position changes nothing
    let marked = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "mark_read",
        json!({"conversation_id": conv_id, "up_to_message_id": second["id"]}),
    )
    .unwrap();
    assert_eq!(marked["cursor"]["last_read_message_id"], second["id"]);
}

#[test]
fn test_mark_read_defaults_to_tail() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);

    send_message(&client, BOB_KEY, &bob_sid, &conv_id, "a");
    let last = send_message(&client, BOB_KEY, &bob_sid, &conv_id, "b");

    let marked = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "mark_read",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(marked["cursor"]["last_read_message_id"], last["id"]);
}

#[test]
fn test_mark_read_unknown_message() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);
    subscribe(&client, ALICE_KEY, &sid, &conv_id);

    let err = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "mark_read",
        json!({"conversation_id": conv_id, "up_to_message_id": "missing"}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32001);
    assert_eq!(err.1, "Message not found");
}

#[test]
fn test_from_join_hides_history_without_since() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    send_message(&client, ALICE_KEY, &alice_sid, &conv_id, "before bob joined");

    call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "subscribe",
        json!({"conversation_id": conv_id, "history_access": "from_join"}),
    )
    .unwrap();

    // No since: pre-join history is invisible
    let got = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 0);

    send_message(&client, ALICE_KEY, &alice_sid, &conv_id, "after bob joined");
    let got = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
    assert_eq!(got["messages"][0]["content"], "after bob joined");

    // An explicit since is honored verbatim and reaches back before the join
    let got = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "get_messages",
        json!({"conversation_id": conv_id, "since": "1970-01-01T00:00:00.000000Z"}),
    )
    .unwrap();
    assert_eq!(got["count"], 2);
}

#[test]
fn test_get_messages_since_and_limit() {
    let client = test_client();
    let sid = open_session(&client, ALICE_KEY);
    let conv_id = setup_conversation(&client, &sid);
    subscribe(&client, ALICE_KEY, &sid, &conv_id);

    let first = send_message(&client, ALICE_KEY, &sid, &conv_id, "one");
    send_message(&client, ALICE_KEY, &sid, &conv_id, "two");
    send_message(&client, ALICE_KEY, &sid, &conv_id, "three");

    let got = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "get_messages",
        json!({"conversation_id": conv_id, "since": first["created_at"]}),
    )
    .unwrap();
    assert_eq!(got["count"], 2);

    let got = call_tool(
        &client,
        ALICE_KEY,
        &sid,
        "get_messages",
        json!({"conversation_id": conv_id, "limit": 2}),
    )
    .unwrap();
    assert_eq!(got["count"], 2);
    assert_eq!(got["messages"][0]["content"], "one");
    assert_eq!(got["messages"][1]["content"], "two");
}

#[test]
fn test_get_messages_requires_subscription() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);

    let err = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap_err();
    assert_eq!(err.0, -32002);
}

#[test]
fn test_subscribe_unsubscribe_list_subscribers() {
    let client = test_client();
    let alice_sid = open_session(&client, ALICE_KEY);
    let bob_sid = open_session(&client, BOB_KEY);

    let conv_id = setup_conversation(&client, &alice_sid);
    subscribe(&client, ALICE_KEY, &alice_sid, &conv_id);
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);

    let listed = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "list_subscribers",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(listed["count"], 2);

    // Subscribing twice keeps a single subscription
    subscribe(&client, BOB_KEY, &bob_sid, &conv_id);
    let listed = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "list_subscribers",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(listed["count"], 2);

    send_message(&client, BOB_KEY, &bob_sid, &conv_id, "kept after unsubscribe");

    let result = call_tool(
        &client,
        BOB_KEY,
        &bob_sid,
        "unsubscribe",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(result["unsubscribed"], true);

    // Messages survive the subscription
    let got = call_tool(
        &client,
        ALICE_KEY,
        &alice_sid,
        "get_messages",
        json!({"conversation_id": conv_id}),
    )
    .unwrap();
    assert_eq!(got["count"], 1);
}
