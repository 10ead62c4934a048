//! Request admission.
//!
//! A [`Guard`] inspects an inbound request and proposes a response status: 200 lets
//! the request through, 4xx rejects it and 5xx reports an internal failure. Guards
//! also decide how long a client should wait before its request is served.

mod admission;
mod cncauth;
mod dflt;
mod null;
mod sessionmap;
mod telemetry;
mod token;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::request::Parts;
use http::StatusCode;
use thiserror::Error;

use crate::botwatch::Watchdog;
use crate::common::{AnonymousUsers, ClientId, UserId};
use crate::config::{GuardConfig, ServiceConfig};
use crate::proxy::cookies::Cookie;
use crate::storage::{StorageError, TelemetryStorage, UserFinder};

pub use cncauth::CncAuthGuard;
pub use dflt::{sigmoid_delay, DefaultGuard};
pub use null::NullGuard;
pub use sessionmap::SessionMapGuard;
pub use telemetry::TelemetryGuard;
pub use token::TokenGuard;

/// Delay applied to banned clients.
pub const ULTRA_DURATION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardType {
    Null,
    Default,
    SessionMap,
    CncAuth,
    Token,
    Telemetry,
}

impl fmt::Display for GuardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardType::Null => "null",
            GuardType::Default => "default",
            GuardType::SessionMap => "sessionmap",
            GuardType::CncAuth => "cncauth",
            GuardType::Token => "token",
            GuardType::Telemetry => "telemetry",
        };
        f.write_str(name)
    }
}

impl GuardConfig {
    pub fn guard_type(&self) -> GuardType {
        match self {
            GuardConfig::Null => GuardType::Null,
            GuardConfig::Default { .. } => GuardType::Default,
            GuardConfig::SessionMap { .. } => GuardType::SessionMap,
            GuardConfig::CncAuth => GuardType::CncAuth,
            GuardConfig::Token { .. } => GuardType::Token,
            GuardConfig::Telemetry => GuardType::Telemetry,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum GuardError {
    #[error("failed to determine user id: {0}")]
    UserLookup(StorageError),

    #[error("failed to test IP ban: {0}")]
    BanCheck(StorageError),

    #[error("failed to log applied delay: {0}")]
    DelayLog(StorageError),

    #[error("{0} guard requires {1}")]
    MissingDependency(GuardType, &'static str),

    #[error("guard configuration mismatch, expected {0}")]
    ConfigMismatch(GuardType),
}

/// Outcome of [`Guard::evaluate_request`].
///
/// `error` is only ever set together with a 5xx status.
#[derive(Debug, Clone)]
pub struct ReqEvaluation {
    pub proposed_status: StatusCode,
    pub client_id: ClientId,
    pub session_id: String,
    /// The request has to be sent with the shared fallback credentials
    pub requires_fallback_cookie: bool,
    pub error: Option<GuardError>,
}

impl ReqEvaluation {
    pub fn admitted(client_id: ClientId, session_id: impl Into<String>) -> Self {
        Self {
            proposed_status: StatusCode::OK,
            client_id,
            session_id: session_id.into(),
            requires_fallback_cookie: false,
            error: None,
        }
    }

    pub fn rejected(status: StatusCode, client_id: ClientId) -> Self {
        Self {
            proposed_status: status,
            client_id,
            session_id: String::new(),
            requires_fallback_cookie: false,
            error: None,
        }
    }

    pub fn failed(client_id: ClientId, error: GuardError) -> Self {
        Self {
            proposed_status: StatusCode::INTERNAL_SERVER_ERROR,
            client_id,
            session_id: String::new(),
            requires_fallback_cookie: false,
            error: Some(error),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_fallback(mut self, requires_fallback_cookie: bool) -> Self {
        self.requires_fallback_cookie = requires_fallback_cookie;
        self
    }

    pub fn is_admitted(&self) -> bool {
        self.proposed_status == StatusCode::OK
    }

    pub fn forbids_access(&self) -> bool {
        self.proposed_status.is_client_error()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayInfo {
    pub delay: Duration,
    pub is_ban: bool,
}

impl DelayInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(delay: Duration) -> Self {
        Self { delay, is_ban: false }
    }

    pub fn ban() -> Self {
        Self { delay: ULTRA_DURATION, is_ban: true }
    }
}

/// Admission policy of a service.
#[async_trait]
pub trait Guard: Send + Sync {
    /// Propose a response status for the request. `fallback_cookie` holds the shared
    /// credentials obtained by re-authentication, if any.
    async fn evaluate_request(
        &self,
        parts: &Parts,
        fallback_cookie: Option<&Cookie>,
    ) -> ReqEvaluation;

    async fn calc_delay(&self, parts: &Parts, client_id: &ClientId)
        -> Result<DelayInfo, GuardError>;

    /// Identify the human user behind the request, even when it is served
    /// with fallback credentials.
    async fn determine_true_user_id(&self, parts: &Parts) -> Result<UserId, GuardError>;

    fn test_user_is_anonymous(&self, user_id: UserId) -> bool;

    async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), GuardError>;

    /// Whether `evaluate_request` can admit a session-less request with the
    /// fallback cookie. Re-authentication is pointless for guards that cannot.
    fn accepts_fallback_cookie(&self) -> bool {
        false
    }

    fn guard_type(&self) -> GuardType;
}

/// Collaborators shared by the guards of all services.
#[derive(Clone, Default)]
pub struct GuardDeps {
    pub user_finder: Option<Arc<dyn UserFinder>>,
    pub telemetry: Option<Arc<dyn TelemetryStorage>>,
    pub watchdog: Option<Arc<Watchdog>>,
    pub anonymous_users: AnonymousUsers,
}

type GuardConstructor =
    fn(&ServiceConfig, &str, &GuardDeps) -> Result<Arc<dyn Guard>, GuardError>;

const GUARD_CONSTRUCTORS: &[(GuardType, GuardConstructor)] = &[
    (GuardType::Null, null::build),
    (GuardType::Default, dflt::build),
    (GuardType::SessionMap, sessionmap::build),
    (GuardType::CncAuth, cncauth::build),
    (GuardType::Token, token::build),
    (GuardType::Telemetry, telemetry::build),
];

/// Create the guard configured for the service mounted at `service_path`.
///
/// Must be called from within a tokio runtime, some guards spawn background tasks.
pub fn build_guard(
    service: &ServiceConfig,
    service_path: &str,
    deps: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    let guard_type = service.guard.guard_type();
    let (_, constructor) = GUARD_CONSTRUCTORS
        .iter()
        .find(|(t, _)| *t == guard_type)
        .ok_or(GuardError::ConfigMismatch(guard_type))?;
    constructor(service, service_path, deps)
}
