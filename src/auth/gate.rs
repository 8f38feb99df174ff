//! Decides who may enqueue work for a named downstream service.
//!
//! Order of evaluation:
//! 1. A forwarded payment token decides alone: trusted subject means allow,
//!    anything else means `Unauthorized`.
//! 2. Paid-only services are closed to everybody else (`PaymentRequired`).
//! 3. The ambient identity is accepted as is, guests included.

use super::token::TokenManager;
use crate::{consts, models::identity::RequestIdentity};
use derive_more::Display;
use std::{collections::HashSet, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AllowedBy {
    #[display("forwarded_token")]
    ForwardedToken,
    #[display("api_key")]
    ApiKey,
    #[display("superadmin")]
    Superadmin,
    #[display("guest")]
    Guest,
    #[display("user")]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DenyReason {
    #[display("unauthorized")]
    Unauthorized,
    #[display("payment_required")]
    PaymentRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(AllowedBy),
    Deny(DenyReason),
}

pub struct AuthGate {
    token_manager: Arc<TokenManager>,
    paid_only_services: HashSet<String>,
}

impl AuthGate {
    pub fn new(token_manager: Arc<TokenManager>, paid_only_services: HashSet<String>) -> Self {
        Self {
            token_manager,
            paid_only_services,
        }
    }

    pub fn is_paid_only(&self, service_name: &str) -> bool {
        self.paid_only_services.contains(service_name)
    }

    pub fn evaluate(
        &self,
        service_name: &str,
        forwarded_token: Option<&str>,
        identity: &RequestIdentity,
    ) -> AuthDecision {
        if let Some(token) = forwarded_token {
            return self.evaluate_forwarded_token(service_name, token);
        }

        if self.is_paid_only(service_name) {
            tracing::info!(service_name, "paid-only service reached without payment token");
            return AuthDecision::Deny(DenyReason::PaymentRequired);
        }

        if identity.is_api_key {
            return AuthDecision::Allow(AllowedBy::ApiKey);
        }
        if identity.is_superadmin() {
            return AuthDecision::Allow(AllowedBy::Superadmin);
        }
        if identity.is_anonymous() {
            return AuthDecision::Allow(AllowedBy::Guest);
        }

        AuthDecision::Allow(AllowedBy::User)
    }

    fn evaluate_forwarded_token(&self, service_name: &str, token: &str) -> AuthDecision {
        let verification = match self.token_manager.verify_token(token) {
            Ok(verification) => verification,
            Err(e) => {
                tracing::warn!(service_name, error = %e, "forwarded token is malformed");
                return AuthDecision::Deny(DenyReason::Unauthorized);
            }
        };

        match verification.subject() {
            Some(consts::TRUSTED_CALLER_SUBJECT) => AuthDecision::Allow(AllowedBy::ForwardedToken),
            Some(subject) => {
                tracing::warn!(service_name, subject, "forwarded token from untrusted subject");
                AuthDecision::Deny(DenyReason::Unauthorized)
            }
            None => {
                tracing::warn!(service_name, "forwarded token failed verification");
                AuthDecision::Deny(DenyReason::Unauthorized)
            }
        }
    }
}
