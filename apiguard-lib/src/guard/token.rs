use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::admission::Admission;
use super::{DelayInfo, Guard, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::common::{extract_client_ip, AnonymousUsers, ClientId, UserId};
use crate::config::{GuardConfig, ServiceConfig};
use crate::proxy::cookies::Cookie;
use crate::session::sha256_hex;

/// Authorizes requests by static API tokens.
///
/// Tokens are configured as SHA-256 hex digests, the plain value is never stored.
pub struct TokenGuard {
    admission: Admission,
    header: String,
    tokens: Vec<(String, UserId)>,
    excluded_paths: Vec<String>,
    anonymous_users: AnonymousUsers,
}

pub(super) fn build(
    service: &ServiceConfig,
    service_path: &str,
    deps: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    let GuardConfig::Token { header, tokens, excluded_paths } = &service.guard else {
        return Err(GuardError::ConfigMismatch(GuardType::Token));
    };
    Ok(Arc::new(TokenGuard {
        admission: Admission::new(GuardType::Token, service, deps),
        header: header.clone(),
        tokens: tokens
            .iter()
            .map(|t| (t.value.to_ascii_lowercase(), UserId(t.user_id)))
            .collect(),
        excluded_paths: excluded_paths.iter().map(|p| join_path(service_path, p)).collect(),
        anonymous_users: deps.anonymous_users.clone(),
    }))
}

fn join_path(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

impl TokenGuard {
    fn validate_token(&self, headers: &HeaderMap) -> UserId {
        let Some(value) = headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return UserId::INVALID;
        };
        let hashed = sha256_hex(value);
        self.tokens
            .iter()
            .find(|(stored, _)| bool::from(stored.as_bytes().ct_eq(hashed.as_bytes())))
            .map(|(_, user_id)| *user_id)
            .unwrap_or(UserId::INVALID)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| p == path)
    }
}

#[async_trait]
impl Guard for TokenGuard {
    async fn evaluate_request(&self, parts: &Parts, _: Option<&Cookie>) -> ReqEvaluation {
        let client_ip = extract_client_ip(parts);
        if self.is_excluded(parts.uri.path()) {
            return self.admission.check(ClientId::anonymous(client_ip), String::new()).await;
        }
        let user_id = self.validate_token(&parts.headers);
        if !user_id.is_valid() {
            debug!(client_ip = %client_ip, header = %self.header, "missing or unknown API token");
            return ReqEvaluation::rejected(StatusCode::UNAUTHORIZED, ClientId::anonymous(client_ip));
        }
        self.admission.check(ClientId::new(client_ip, user_id), String::new()).await
    }

    async fn calc_delay(&self, _: &Parts, _: &ClientId) -> Result<DelayInfo, GuardError> {
        Ok(DelayInfo::none())
    }

    async fn determine_true_user_id(&self, parts: &Parts) -> Result<UserId, GuardError> {
        Ok(self.validate_token(&parts.headers))
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
        GuardType::Token
    }
}
