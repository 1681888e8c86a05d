use rocket::serde::json::Json;
use rocket::{State, catch, get};

use crate::session::SessionRegistry;
use crate::store::Store;

#[get("/health")]
pub fn health(store: &State<Store>, sessions: &State<SessionRegistry>) -> Json<serde_json::Value> {
    let conn = store.conn();
    let agents: i64 = conn
        .query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))
        .unwrap_or(0);
    let projects: i64 = conn
        .query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))
        .unwrap_or(0);
    let conversations: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
        .unwrap_or(0);
    let messages: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
        .unwrap_or(0);

    Json(serde_json::json!({
        "ok": true,
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "agents": agents,
        "projects": projects,
        "conversations": conversations,
        "messages": messages,
        "sessions": sessions.len()
    }))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
