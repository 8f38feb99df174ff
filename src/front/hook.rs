//! Inbound hook endpoint.
//!
//! Requests are validated here before anything reaches the gateway: rate
//! limit, method, content type, service name and JSON body, in that order.

use ntex::{http, util::Bytes, web};
use serde_json::json;

use crate::{
    api::enqueue::{AuthContext, EnqueueError},
    consts,
    front::{
        AppState,
        errors::{ServerError, UserError},
    },
    models::identity::RequestIdentity,
    services::RateLimitDecision,
};

fn is_valid_service_name(service_name: &str) -> bool {
    !service_name.is_empty()
        && service_name.len() <= consts::MAX_SERVICE_NAME_LEN
        && service_name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn is_json_content_type(req: &web::HttpRequest) -> bool {
    req.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(consts::JSON_CONTENT_TYPE))
}

/// Bucket for the rate limiter, the peer address when the caller is anonymous
fn rate_limit_key(req: &web::HttpRequest, identity: &RequestIdentity) -> String {
    identity.rate_limit_key().unwrap_or_else(|| {
        req.peer_addr()
            .map(|addr| format!("ip:{}", addr.ip()))
            .unwrap_or_else(|| "ip:unknown".to_string())
    })
}

fn forwarded_token(req: &web::HttpRequest) -> Option<&str> {
    req.headers()
        .get(consts::FORWARDED_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn enqueue_error(err: EnqueueError) -> web::Error {
    match err {
        EnqueueError::MethodNotAllowed(method) => UserError::MethodNotAllowed(method).into(),
        EnqueueError::Unauthorized => UserError::Unauthorized.into(),
        EnqueueError::PaymentRequired => UserError::PaymentRequired.into(),
        EnqueueError::Queue(msg) => ServerError::QueueUnavailable(msg).into(),
    }
}

/// Accepts a hook for `service` and stores it for delivery.
///
/// Bound to every method so non-POST calls get a 405 instead of a 404.
///
/// # Returns
/// - 202 once the message is confirmed by the broker
/// - 400/401/402/405/415/429 when the request is rejected
/// - 500 when the broker did not confirm the write
pub async fn enqueue_hook(
    req: web::HttpRequest,
    service: web::types::Path<String>,
    identity: RequestIdentity,
    body: Bytes,
    app_state: web::types::State<AppState>,
) -> Result<web::HttpResponse, web::Error> {
    let _span = logfire::span!("enqueue_hook").entered();

    if let RateLimitDecision::Throttled { retry_after } = app_state
        .rate_limiter
        .check(&rate_limit_key(&req, &identity))
    {
        // whole seconds, never 0
        let retry_after = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        return Err(UserError::TooManyRequests(retry_after.max(1)).into());
    }

    if req.method() != http::Method::POST {
        return Err(UserError::MethodNotAllowed(req.method().to_string()).into());
    }

    if !is_json_content_type(&req) {
        return Err(UserError::UnsupportedMediaType.into());
    }

    let service_name = service.into_inner();
    if !is_valid_service_name(&service_name) {
        return Err(UserError::InvalidInput(format!(
            "service name must be 1 to {} alphanumeric characters",
            consts::MAX_SERVICE_NAME_LEN
        ))
        .into());
    }

    serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| UserError::InvalidInput(format!("body is not valid JSON: {e}")))?;

    let message = app_state
        .gateway
        .enqueue(
            &service_name,
            req.method().as_str(),
            &body,
            AuthContext {
                forwarded_token: forwarded_token(&req),
                identity: &identity,
            },
        )
        .await
        .map_err(enqueue_error)?;

    tracing::debug!(message_id = %message.id, "hook accepted");

    Ok(web::HttpResponse::Accepted().json(&json!({ "success": true })))
}

/// Liveness probe
#[web::get("/health")]
pub async fn health() -> impl web::Responder {
    web::HttpResponse::Ok().json(&json!({ "status": "ok" }))
}

/// Return a [UrlNotFound](UserError::UrlNotFound) error for urls not defined
pub async fn serve_not_found() -> Result<web::HttpResponse, web::Error> {
    Err(UserError::UrlNotFound.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::enqueue::EnqueueGateway,
        auth::{gate::AuthGate, token::tests::es256_manager},
        front::routes,
        services::{
            MockDurableQueue, MockRateLimiter, RateLimiter,
            memory::MemoryQueue,
            rate_limit::KeyedRateLimiter,
        },
    };
    use ntex::web::test;
    use std::{sync::Arc, time::Duration};

    fn app_state(queue: crate::services::ImplDurableQueue, rate_limiter: Arc<dyn RateLimiter>) -> AppState {
        let gate = AuthGate::new(Arc::new(es256_manager()), ["premium".to_string()].into());
        AppState {
            gateway: Arc::new(EnqueueGateway::new(Arc::new(gate), queue)),
            rate_limiter,
        }
    }

    fn open_state(queue: crate::services::ImplDurableQueue) -> AppState {
        app_state(queue, Arc::new(KeyedRateLimiter::per_minute(1000)))
    }

    macro_rules! init_app {
        ($state:expr) => {
            test::init_service(
                web::App::new()
                    .state($state)
                    .configure(routes::hooks)
                    .default_service(web::route().to(serve_not_found)),
            )
            .await
        };
    }

    fn json_post(uri: &str, body: &'static str) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .set_payload(body)
    }

    #[test]
    fn test_service_name_rules() {
        assert!(is_valid_service_name("billing"));
        assert!(is_valid_service_name("Billing2"));
        assert!(is_valid_service_name(&"a".repeat(consts::MAX_SERVICE_NAME_LEN)));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("billing-v2"));
        assert!(!is_valid_service_name("billing_v2"));
        assert!(!is_valid_service_name("bill.ing"));
        assert!(!is_valid_service_name(&"a".repeat(consts::MAX_SERVICE_NAME_LEN + 1)));
    }

    #[ntex::test]
    async fn test_valid_hook_is_accepted_and_stored() {
        let queue = Arc::new(MemoryQueue::default());
        let app = init_app!(open_state(queue.clone()));

        let req = json_post("/hook/billing", r#"{"a":1}"#).to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::ACCEPTED);
        let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert_eq!(body, json!({ "success": true }));
        let stored = queue.ready_messages();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].service_name, "billing");
        assert_eq!(stored[0].body, br#"{"a":1}"#.to_vec());
    }

    #[ntex::test]
    async fn test_wrong_content_type_is_415() {
        let queue = Arc::new(MemoryQueue::default());
        let app = init_app!(open_state(queue.clone()));

        let req = test::TestRequest::post()
            .uri("/hook/billing")
            .header(http::header::CONTENT_TYPE, "text/plain")
            .set_payload("{}")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(queue.ready_messages().is_empty());
    }

    #[ntex::test]
    async fn test_invalid_service_name_is_400() {
        let queue = Arc::new(MemoryQueue::default());
        let app = init_app!(open_state(queue.clone()));

        let req = json_post("/hook/billing-v2", "{}").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert_eq!(body["success"], json!(false));
        assert!(queue.ready_messages().is_empty());
    }

    #[ntex::test]
    async fn test_invalid_json_is_400() {
        let queue = Arc::new(MemoryQueue::default());
        let app = init_app!(open_state(queue.clone()));

        let req = json_post("/hook/billing", "{not json").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
        assert!(queue.ready_messages().is_empty());
    }

    #[ntex::test]
    async fn test_non_post_is_405() {
        let mut queue = MockDurableQueue::new();
        queue.expect_enqueue().times(0);
        let app = init_app!(open_state(Arc::new(queue)));

        let req = test::TestRequest::put()
            .uri("/hook/billing")
            .header(http::header::CONTENT_TYPE, "application/json")
            .set_payload("{}")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::METHOD_NOT_ALLOWED);
    }

    #[ntex::test]
    async fn test_non_post_without_json_content_type_is_405() {
        let mut queue = MockDurableQueue::new();
        queue.expect_enqueue().times(0);
        let app = init_app!(open_state(Arc::new(queue)));

        for req in [
            test::TestRequest::get().uri("/hook/billing").to_request(),
            test::TestRequest::delete()
                .uri("/hook/billing")
                .header(http::header::CONTENT_TYPE, "text/plain")
                .to_request(),
        ] {
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), http::StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    #[ntex::test]
    async fn test_paid_only_service_is_402() {
        let mut queue = MockDurableQueue::new();
        queue.expect_enqueue().times(0);
        let app = init_app!(open_state(Arc::new(queue)));

        let req = json_post("/hook/premium", "{}")
            .header(consts::IDENTITY_UID_HEADER, "root")
            .header(consts::IDENTITY_ROLES_HEADER, "superadmin")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::PAYMENT_REQUIRED);
    }

    #[ntex::test]
    async fn test_untrusted_forwarded_token_is_401() {
        let mut queue = MockDurableQueue::new();
        queue.expect_enqueue().times(0);
        let app = init_app!(open_state(Arc::new(queue)));

        let req = json_post("/hook/billing", "{}")
            .header(consts::FORWARDED_TOKEN_HEADER, "not-a-token")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[ntex::test]
    async fn test_queue_failure_is_500() {
        let mut queue = MockDurableQueue::new();
        queue
            .expect_enqueue()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("publish not confirmed")));
        let app = init_app!(open_state(Arc::new(queue)));

        let req = json_post("/hook/billing", "{}").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert_eq!(body["success"], json!(false));
    }

    #[ntex::test]
    async fn test_throttled_caller_gets_retry_after() {
        let mut queue = MockDurableQueue::new();
        queue.expect_enqueue().times(0);
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_check()
            .withf(|key| key == "uid:u-7")
            .times(1)
            .returning(|_| RateLimitDecision::Throttled {
                retry_after: Duration::from_millis(2500),
            });
        let app = init_app!(app_state(Arc::new(queue), Arc::new(limiter)));

        let req = json_post("/hook/billing", "{}")
            .header(consts::IDENTITY_UID_HEADER, "u-7")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers()
                .get(http::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("3")
        );
    }

    #[ntex::test]
    async fn test_health() {
        let app = init_app!(open_state(Arc::new(MemoryQueue::default())));

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::OK);
    }

    #[ntex::test]
    async fn test_unknown_url_is_404() {
        let app = init_app!(open_state(Arc::new(MemoryQueue::default())));

        let req = test::TestRequest::get().uri("/nope").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);
    }
}
