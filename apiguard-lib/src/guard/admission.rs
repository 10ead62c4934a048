use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use tracing::debug;

use super::{DelayInfo, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::common::ClientId;
use crate::config::ServiceConfig;
use crate::proxy::cookies::cookie_value;
use crate::security::rate_limit::ClientRateLimiter;
use crate::session::{HttpSession, SessionType};
use crate::storage::TelemetryStorage;

/// Rate limit and ban checks shared by the guards.
pub(super) struct Admission {
    guard_type: GuardType,
    rate_limiter: ClientRateLimiter,
    storage: Option<Arc<dyn TelemetryStorage>>,
}

impl Admission {
    pub(super) fn new(guard_type: GuardType, service: &ServiceConfig, deps: &GuardDeps) -> Self {
        Self {
            guard_type,
            rate_limiter: ClientRateLimiter::new(&service.limits),
            storage: deps.telemetry.clone(),
        }
    }

    /// Rate limit first, then the IP ban.
    pub(super) async fn check(&self, client_id: ClientId, session_id: String) -> ReqEvaluation {
        if !self.rate_limiter.allow(&client_id.ip) {
            debug!(
                guard = %self.guard_type,
                client_id = %client_id.key(),
                "limiting client with status 429"
            );
            return ReqEvaluation::rejected(StatusCode::TOO_MANY_REQUESTS, client_id)
                .with_session(session_id);
        }
        match self.is_banned(&client_id.ip).await {
            Err(e) => ReqEvaluation::failed(client_id, e).with_session(session_id),
            Ok(true) => {
                debug!(guard = %self.guard_type, client_id = %client_id.key(), "applied IP ban");
                ReqEvaluation::rejected(StatusCode::FORBIDDEN, client_id).with_session(session_id)
            }
            Ok(false) => ReqEvaluation::admitted(client_id, session_id),
        }
    }

    pub(super) async fn is_banned(&self, ip: &str) -> Result<bool, GuardError> {
        match &self.storage {
            Some(storage) => storage.test_ip_ban(ip).await.map_err(GuardError::BanCheck),
            None => Ok(false),
        }
    }

    pub(super) async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), GuardError> {
        match &self.storage {
            Some(storage) => {
                storage.log_applied_delay(delay, client_id).await.map_err(GuardError::DelayLog)
            }
            None => Ok(()),
        }
    }
}

/// Names and format of the session cookies of a service.
pub(super) struct SessionCookies {
    pub(super) frontend: String,
    pub(super) backend: String,
    pub(super) session_type: SessionType,
}

impl SessionCookies {
    pub(super) fn from_service(service: &ServiceConfig) -> Self {
        Self {
            frontend: service.external_session_cookie.clone(),
            backend: service.backend_session_cookie.clone(),
            session_type: service.session_type,
        }
    }

    /// The frontend session if present, the backend session otherwise.
    pub(super) fn find(&self, headers: &HeaderMap) -> Option<HttpSession> {
        [&self.frontend, &self.backend]
            .into_iter()
            .filter_map(|name| cookie_value(headers, name))
            .map(|value| self.session_type.parse(&value))
            .find(|session| !session.is_zero())
    }

    pub(super) fn backend(&self, headers: &HeaderMap) -> Option<HttpSession> {
        cookie_value(headers, &self.backend)
            .map(|value| self.session_type.parse(&value))
            .filter(|session| !session.is_zero())
    }

    pub(super) fn parse(&self, raw: &str) -> HttpSession {
        self.session_type.parse(raw)
    }
}
