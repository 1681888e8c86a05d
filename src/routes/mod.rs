// Route module decomposition — transport surface in mcp.rs, health in system.rs.
// Shared request guards live here; route functions in submodules.

mod mcp;
mod system;

pub use mcp::{mcp_delete, mcp_post, mcp_stream};
pub use system::{health, not_found};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

/// Bearer token from the Authorization header.
pub struct BearerToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(token) = auth.strip_prefix("Bearer ")
        {
            return Outcome::Success(BearerToken(token.trim().to_string()));
        }
        Outcome::Forward(Status::Unauthorized)
    }
}

/// `mcp-session-id` header; clients must send it on every call after the
/// first `initialize` response.
pub struct SessionId(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionId {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match req.headers().get_one("mcp-session-id") {
            Some(sid) if !sid.trim().is_empty() => {
                Outcome::Success(SessionId(sid.trim().to_string()))
            }
            _ => Outcome::Forward(Status::BadRequest),
        }
    }
}
