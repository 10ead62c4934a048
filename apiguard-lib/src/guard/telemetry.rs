use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use http::request::Parts;

use super::admission::{Admission, SessionCookies};
use super::{DelayInfo, Guard, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::botwatch::Watchdog;
use crate::common::{extract_client_ip, AnonymousUsers, ClientId, UserId};
use crate::config::ServiceConfig;
use crate::proxy::cookies::Cookie;

/// Feeds the watchdog and enforces IP bans.
///
/// Bot-like behavior is only recorded here, it never rejects a request by itself.
pub struct TelemetryGuard {
    admission: Admission,
    cookies: SessionCookies,
    watchdog: Arc<Watchdog>,
    anonymous_users: AnonymousUsers,
}

pub(super) fn build(
    service: &ServiceConfig,
    _: &str,
    deps: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    let watchdog = deps
        .watchdog
        .clone()
        .ok_or(GuardError::MissingDependency(GuardType::Telemetry, "a watchdog"))?;
    Ok(Arc::new(TelemetryGuard {
        admission: Admission::new(GuardType::Telemetry, service, deps),
        cookies: SessionCookies::from_service(service),
        watchdog,
        anonymous_users: deps.anonymous_users.clone(),
    }))
}

#[async_trait]
impl Guard for TelemetryGuard {
    async fn evaluate_request(&self, parts: &Parts, _: Option<&Cookie>) -> ReqEvaluation {
        let client_ip = extract_client_ip(parts);
        let session_id = self
            .cookies
            .find(&parts.headers)
            .map(|s| s.to_string())
            .unwrap_or_default();
        self.watchdog.observe(&client_ip, &session_id, Utc::now()).await;
        self.admission.check(ClientId::anonymous(client_ip), session_id).await
    }

    async fn calc_delay(&self, _: &Parts, client_id: &ClientId) -> Result<DelayInfo, GuardError> {
        if self.admission.is_banned(&client_id.ip).await? {
            return Ok(DelayInfo::ban());
        }
        Ok(DelayInfo::none())
    }

    async fn determine_true_user_id(&self, _: &Parts) -> Result<UserId, GuardError> {
        Ok(UserId::INVALID)
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

    fn guard_type(&self) -> GuardType {
        GuardType::Telemetry
    }
}
