use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;
use http::StatusCode;
use tracing::debug;

use super::admission::{Admission, SessionCookies};
use super::{DelayInfo, Guard, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::common::{extract_client_ip, AnonymousUsers, ClientId, UserId};
use crate::config::{GuardConfig, ServiceConfig};
use crate::proxy::cookies::Cookie;
use crate::storage::UserFinder;

/// Maps session cookies to users.
///
/// The frontend cookie is preferred. Requests without any session cookie are
/// served with the fallback credentials once the proxy holds them, and rejected
/// with 401 otherwise.
pub struct SessionMapGuard {
    admission: Admission,
    cookies: SessionCookies,
    user_finder: Option<Arc<dyn UserFinder>>,
    anonymous_users: AnonymousUsers,
    allow_anonymous: bool,
}

pub(super) fn build(
    service: &ServiceConfig,
    _: &str,
    deps: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    let GuardConfig::SessionMap { allow_anonymous } = &service.guard else {
        return Err(GuardError::ConfigMismatch(GuardType::SessionMap));
    };
    Ok(Arc::new(SessionMapGuard {
        admission: Admission::new(GuardType::SessionMap, service, deps),
        cookies: SessionCookies::from_service(service),
        user_finder: deps.user_finder.clone(),
        anonymous_users: deps.anonymous_users.clone(),
        allow_anonymous: *allow_anonymous,
    }))
}

#[async_trait]
impl Guard for SessionMapGuard {
    async fn evaluate_request(
        &self,
        parts: &Parts,
        fallback_cookie: Option<&Cookie>,
    ) -> ReqEvaluation {
        let client_ip = extract_client_ip(parts);
        let (session, uses_fallback) = match self.cookies.find(&parts.headers) {
            Some(session) => (session, false),
            None => match fallback_cookie {
                Some(cookie) => {
                    debug!(client_ip = %client_ip, "using fallback cookie");
                    (self.cookies.parse(&cookie.value), true)
                }
                None => {
                    debug!(
                        client_ip = %client_ip,
                        frontend_cookie = %self.cookies.frontend,
                        backend_cookie = %self.cookies.backend,
                        "failed to find session cookie"
                    );
                    return ReqEvaluation::rejected(
                        StatusCode::UNAUTHORIZED,
                        ClientId::anonymous(client_ip),
                    )
                    .with_fallback(true);
                }
            },
        };
        let Some(finder) = &self.user_finder else {
            return ReqEvaluation::admitted(ClientId::anonymous(client_ip), "")
                .with_fallback(uses_fallback);
        };
        let user_id = match finder.find_user_by_session(&session).await {
            Ok(user_id) => user_id,
            Err(e) => {
                return ReqEvaluation::failed(ClientId::anonymous(client_ip), GuardError::UserLookup(e))
                    .with_fallback(uses_fallback);
            }
        };
        if !user_id.is_valid() {
            if self.allow_anonymous {
                return self
                    .admission
                    .check(ClientId::anonymous(client_ip), String::new())
                    .await
                    .with_fallback(uses_fallback);
            }
            debug!(client_ip = %client_ip, "session does not belong to any user");
            return ReqEvaluation::rejected(StatusCode::UNAUTHORIZED, ClientId::anonymous(client_ip))
                .with_fallback(uses_fallback);
        }
        self.admission
            .check(ClientId::new(client_ip, user_id), session.to_string())
            .await
            .with_fallback(uses_fallback)
    }

    async fn calc_delay(&self, _: &Parts, _: &ClientId) -> Result<DelayInfo, GuardError> {
        Ok(DelayInfo::none())
    }

    async fn determine_true_user_id(&self, parts: &Parts) -> Result<UserId, GuardError> {
        let (Some(finder), Some(session)) = (&self.user_finder, self.cookies.find(&parts.headers))
        else {
            return Ok(UserId::INVALID);
        };
        finder.find_user_by_session(&session).await.map_err(GuardError::UserLookup)
    }

    fn test_user_is_anonymous(&self, user_id: UserId) -> bool {
        self.anonymous_users.is_anonymous(user_id)
    }

    async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), GuardError> {
        self.admission.log_applied_delay(delay, client_id).await
    }

    fn accepts_fallback_cookie(&self) -> bool {
        true
    }

    fn guard_type(&self) -> GuardType {
        GuardType::SessionMap
    }
}
