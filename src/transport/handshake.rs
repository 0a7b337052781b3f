//! Upgrade request validation
//!
//! Runs inside the tungstenite handshake callback, so a rejected request
//! gets a plain HTTP error response and never becomes a WebSocket.

use tungstenite::handshake::server::{ErrorResponse, Request};
use tungstenite::http::{StatusCode, header};

use crate::client::Username;

pub const PATH_PREFIX: &str = "/fm/";

/// Origins allowed to open a connection. Empty allows everyone; `*` is a
/// wildcard entry; other entries match case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let origin = origin.unwrap_or_default();
        self.allowed
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }
}

/// Validate an upgrade request and return the normalized username it asks
/// for.
pub fn check_request(req: &Request, origins: &OriginPolicy) -> Result<Username, ErrorResponse> {
    let Some(raw) = req.uri().path().strip_prefix(PATH_PREFIX) else {
        return Err(reject(StatusCode::NOT_FOUND, "Not found"));
    };

    let username = Username::parse(raw).map_err(|e| reject(StatusCode::BAD_REQUEST, &e.to_string()))?;

    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origins.allows(origin) {
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    Ok(username)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
