use std::sync::Arc;

use async_trait::async_trait;
use http::request::Parts;

use super::{DelayInfo, Guard, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::common::{extract_client_ip, ClientId, UserId};
use crate::config::ServiceConfig;
use crate::proxy::cookies::Cookie;

/// Lets every request through.
#[derive(Debug, Default)]
pub struct NullGuard;

pub(super) fn build(
    _: &ServiceConfig,
    _: &str,
    _: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    Ok(Arc::new(NullGuard))
}

#[async_trait]
impl Guard for NullGuard {
    async fn evaluate_request(&self, parts: &Parts, _: Option<&Cookie>) -> ReqEvaluation {
        ReqEvaluation::admitted(ClientId::anonymous(extract_client_ip(parts)), "")
    }

    async fn calc_delay(&self, _: &Parts, _: &ClientId) -> Result<DelayInfo, GuardError> {
        Ok(DelayInfo::none())
    }

    async fn determine_true_user_id(&self, _: &Parts) -> Result<UserId, GuardError> {
        Ok(UserId::INVALID)
    }

    fn test_user_is_anonymous(&self, _: UserId) -> bool {
        true
    }

    async fn log_applied_delay(&self, _: &DelayInfo, _: &ClientId) -> Result<(), GuardError> {
        Ok(())
    }

    fn guard_type(&self) -> GuardType {
        GuardType::Null
    }
}
