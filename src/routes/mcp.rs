use rocket::http::{Header, Status};
use rocket::response::stream::{Event, EventStream};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use serde_json::{Value, json};
use tokio::time::{Duration, interval};

use crate::auth::{AuthError, AuthProvider, AuthedAgent};
use crate::events::EventBus;
use crate::rpc::{self, RpcRequest};
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::tools;

use super::{BearerToken, SessionId};

/// JSON response that can carry the `mcp-session-id` header alongside any
/// status code.
pub struct RpcResponse {
    status: Status,
    body: Value,
    session_id: Option<String>,
}

impl RpcResponse {
    fn new(status: Status, body: Value) -> Self {
        RpcResponse {
            status,
            body,
            session_id: None,
        }
    }

    fn with_session(status: Status, body: Value, session_id: String) -> Self {
        RpcResponse {
            status,
            body,
            session_id: Some(session_id),
        }
    }
}

// Generic over the outgoing lifetime so it can share a Result with the
// request-bound SSE responder
impl<'r, 'o: 'r> Responder<'r, 'o> for RpcResponse {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> response::Result<'o> {
        let mut builder = Response::build_from(Json(self.body).respond_to(req)?);
        builder.status(self.status);
        if let Some(sid) = self.session_id {
            builder.header(Header::new("mcp-session-id", sid));
        }
        builder.ok()
    }
}

fn auth_failure(err: AuthError) -> RpcResponse {
    let status = match err {
        AuthError::Missing => Status::Unauthorized,
        AuthError::Invalid => Status::Forbidden,
        AuthError::Store(_) => Status::InternalServerError,
    };
    RpcResponse::new(status, json!({"error": err.to_string()}))
}

fn session_not_found() -> RpcResponse {
    RpcResponse::new(Status::NotFound, json!({"error": "Session not found"}))
}

/// JSON-RPC requests and notifications. `initialize` mints a session whose id
/// is echoed in the `mcp-session-id` header; every later call must send it
/// back.
#[post("/mcp", format = "json", data = "<body>")]
pub fn mcp_post(
    store: &State<Store>,
    auth: &State<AuthProvider>,
    sessions: &State<SessionRegistry>,
    token: Option<BearerToken>,
    sid: Option<SessionId>,
    body: Json<Value>,
) -> RpcResponse {
    let authed = match auth.authenticate(store, token.as_ref().map(|t| t.0.as_str())) {
        Ok(a) => a,
        Err(e) => return auth_failure(e),
    };

    let request: RpcRequest = match serde_json::from_value(body.into_inner()) {
        Ok(r) => r,
        Err(e) => {
            return RpcResponse::new(
                Status::Ok,
                rpc::error_response(
                    &Value::Null,
                    rpc::INVALID_REQUEST,
                    &format!("Invalid JSON-RPC request: {e}"),
                ),
            );
        }
    };
    if request.jsonrpc != "2.0" {
        return RpcResponse::new(
            Status::Ok,
            rpc::error_response(
                &request.id.unwrap_or(Value::Null),
                rpc::INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ),
        );
    }

    if request.method == "initialize" {
        let id = match &request.id {
            Some(id) => id.clone(),
            None => {
                return RpcResponse::new(
                    Status::Ok,
                    rpc::error_response(
                        &Value::Null,
                        rpc::INVALID_REQUEST,
                        "initialize must be a request",
                    ),
                );
            }
        };
        let session = sessions.create(&authed);
        let result = json!({
            "protocolVersion": rpc::PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {"tools": {}}
        });
        return RpcResponse::with_session(Status::Ok, rpc::response(&id, result), session.id);
    }

    // Everything after initialize runs inside an existing session
    let sid = match sid {
        Some(s) => s.0,
        None => {
            return RpcResponse::new(
                Status::BadRequest,
                json!({"error": "Missing mcp-session-id header"}),
            );
        }
    };
    let session = match sessions.get(&sid) {
        Some(s) => s,
        None => return session_not_found(),
    };

    if request.is_notification() {
        if request.method == "notifications/initialized" {
            sessions.mark_initialized(&sid);
        }
        // Notifications never get a response body
        return RpcResponse::with_session(Status::Accepted, json!({}), sid);
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    if !session.initialized {
        return RpcResponse::with_session(
            Status::Ok,
            rpc::error_response(&id, rpc::NOT_INITIALIZED, "Session not initialized"),
            sid,
        );
    }

    let body = match request.method.as_str() {
        "ping" => rpc::response(&id, json!({})),
        "tools/list" => rpc::response(&id, tools::list_tools()),
        "tools/call" => {
            let name = request.params.get("name").and_then(|v| v.as_str());
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(json!({}));
            match name {
                Some(name) => match tools::dispatch(store, &authed, name, args) {
                    Ok(result) => rpc::response(&id, result),
                    Err(e) => rpc::error_response(&id, e.code(), &e.to_string()),
                },
                None => rpc::error_response(&id, rpc::INVALID_PARAMS, "Missing tool name"),
            }
        }
        other => rpc::error_response(
            &id,
            rpc::METHOD_NOT_FOUND,
            &format!("Unknown method '{other}'"),
        ),
    };
    RpcResponse::with_session(Status::Ok, body, sid)
}

/// Long-lived SSE channel: one JSON-RPC notification per `data:` line for
/// every message the session's agent is subscribed to and cleared to see.
#[get("/mcp")]
pub fn mcp_stream<'r>(
    store: &'r State<Store>,
    auth: &'r State<AuthProvider>,
    events: &'r State<EventBus>,
    sessions: &'r State<SessionRegistry>,
    token: Option<BearerToken>,
    sid: Option<SessionId>,
) -> Result<EventStream![Event + 'r], RpcResponse> {
    let authed: AuthedAgent = auth
        .authenticate(store, token.as_ref().map(|t| t.0.as_str()))
        .map_err(auth_failure)?;
    let sid = match sid {
        Some(s) => s.0,
        None => {
            return Err(RpcResponse::new(
                Status::BadRequest,
                json!({"error": "Missing mcp-session-id header"}),
            ));
        }
    };
    if sessions.get(&sid).is_none() {
        return Err(session_not_found());
    }
    let mut rx = events.subscribe();
    let agent_id = authed.id;
    let clearance = authed.clearance_level;

    Ok(EventStream! {
        let mut heartbeat = interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Ok(event) => {
                            // Stream dies with its session
                            if sessions.get(&sid).is_none() { break; }
                            let subscribed = store
                                .is_subscribed(event.conversation_id(), &agent_id)
                                .unwrap_or(false);
                            if subscribed && event.visible_to(&agent_id, clearance) {
                                yield Event::json(&event.to_notification());
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        // Lagged receivers resynchronize on the next event
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if sessions.get(&sid).is_none() { break; }
                    yield Event::comment("keep-alive");
                }
            }
        }
    })
}

/// Best-effort session teardown.
#[delete("/mcp")]
pub fn mcp_delete(
    store: &State<Store>,
    auth: &State<AuthProvider>,
    sessions: &State<SessionRegistry>,
    token: Option<BearerToken>,
    sid: Option<SessionId>,
) -> RpcResponse {
    if let Err(e) = auth.authenticate(store, token.as_ref().map(|t| t.0.as_str())) {
        return auth_failure(e);
    }
    let sid = match sid {
        Some(s) => s.0,
        None => {
            return RpcResponse::new(
                Status::BadRequest,
                json!({"error": "Missing mcp-session-id header"}),
            );
        }
    };
    if sessions.remove(&sid) {
        RpcResponse::new(Status::Ok, json!({"ok": true}))
    } else {
        session_not_found()
    }
}
