use crate::{
    auth::gate::{AuthDecision, AuthGate, DenyReason},
    metric,
    models::{identity::RequestIdentity, queue_message::QueueMessage},
    services::ImplDurableQueue,
};
use derive_more::{Display, Error};
use std::sync::Arc;

const ACCEPTED_METHOD: &str = "POST";

#[derive(Debug, Display, Error)]
pub enum EnqueueError {
    #[display("method {_0} cannot be enqueued")]
    MethodNotAllowed(#[error(not(source))] String),
    #[display("caller is not allowed to reach this service")]
    Unauthorized,
    #[display("service is only reachable after a confirmed payment")]
    PaymentRequired,
    #[display("message could not be stored: {_0}")]
    Queue(#[error(not(source))] String),
}

impl From<DenyReason> for EnqueueError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::Unauthorized => EnqueueError::Unauthorized,
            DenyReason::PaymentRequired => EnqueueError::PaymentRequired,
        }
    }
}

/// What the HTTP layer knows about the caller
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub forwarded_token: Option<&'a str>,
    pub identity: &'a RequestIdentity,
}

pub struct EnqueueGateway {
    auth_gate: Arc<AuthGate>,
    queue: ImplDurableQueue,
}

impl EnqueueGateway {
    pub fn new(auth_gate: Arc<AuthGate>, queue: ImplDurableQueue) -> Self {
        Self { auth_gate, queue }
    }

    /// Authorizes the caller and commits the hook to the durable queue.
    ///
    /// `service_name` and `raw_body` are expected to be validated already.
    /// Nothing is written unless every check passes, and a queue error means
    /// the message must be considered lost.
    pub async fn enqueue(
        &self,
        service_name: &str,
        method: &str,
        raw_body: &[u8],
        auth: AuthContext<'_>,
    ) -> Result<QueueMessage, EnqueueError> {
        if method != ACCEPTED_METHOD {
            return Err(EnqueueError::MethodNotAllowed(method.to_string()));
        }

        match self
            .auth_gate
            .evaluate(service_name, auth.forwarded_token, auth.identity)
        {
            AuthDecision::Allow(allowed_by) => {
                metric::incr_enqueue_decision_statds(&allowed_by.to_string());
            }
            AuthDecision::Deny(reason) => {
                metric::incr_enqueue_decision_statds(&reason.to_string());
                return Err(reason.into());
            }
        }

        let message = QueueMessage::new(service_name, method, raw_body.to_vec());
        self.queue.enqueue(&message).await.map_err(|e| {
            tracing::error!(service_name, error = %e, "failed to enqueue hook");
            EnqueueError::Queue(e.to_string())
        })?;

        tracing::info!(message_id = %message.id, service_name, "hook enqueued");

        Ok(message)
    }
}
