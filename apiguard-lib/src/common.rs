//! Identity types shared by guards, the watchdog and the proxy core.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Numeric identity of a registered user.
///
/// Unauthenticated requests carry [`UserId::INVALID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    pub const INVALID: UserId = UserId(-1);

    pub fn is_valid(self) -> bool {
        self.0 > -1
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rate limiting and audit identity of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ClientId {
    pub ip: String,
    pub user_id: UserId,
}

impl ClientId {
    pub fn new(ip: impl Into<String>, user_id: UserId) -> Self {
        Self { ip: ip.into(), user_id }
    }

    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self::new(ip, UserId::INVALID)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.user_id)
    }
}

/// Users treated as anonymous even though they own a valid account
/// (shared application accounts used with fallback credentials).
#[derive(Debug, Clone, Default)]
pub struct AnonymousUsers(Vec<UserId>);

impl AnonymousUsers {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self(ids.into_iter().map(UserId).collect())
    }

    pub fn is_anonymous(&self, user_id: UserId) -> bool {
        !user_id.is_valid() || self.0.contains(&user_id)
    }

    pub fn first(&self) -> Option<UserId> {
        self.0.first().copied()
    }
}

/// Peer address of the downstream connection, stored in request extensions by the server.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Resolve the client IP: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then the connection peer.
pub fn extract_client_ip(parts: &http::request::Parts) -> String {
    if let Some(xff) = parts.headers.get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first_ip) = xff_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }
    if let Some(real_ip) = parts.headers.get("x-real-ip") {
        if let Ok(real_ip) = real_ip.to_str() {
            if !real_ip.trim().is_empty() {
                return real_ip.trim().to_string();
            }
        }
    }
    parts
        .extensions
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip().to_string())
        .unwrap_or_default()
}
