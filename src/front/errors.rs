use derive_more::{Display, Error};
use ntex::{http, web};
use serde_json::json;

fn json_error_body(message: &str) -> serde_json::Value {
    json!({
        "success": false,
        "error": message,
    })
}

#[derive(Debug, Display, Error)]
pub enum UserError {
    #[display("resource not found")]
    UrlNotFound,
    #[display("caller is not allowed to reach this service")]
    Unauthorized,
    #[display("service requires a confirmed payment")]
    PaymentRequired,
    #[display("method {_0} is not accepted")]
    MethodNotAllowed(#[error(not(source))] String),
    #[display("content type must be application/json")]
    UnsupportedMediaType,
    #[display("invalid input: {_0}")]
    InvalidInput(#[error(not(source))] String),
    #[display("too many requests, retry in {_0} seconds")]
    TooManyRequests(#[error(not(source))] u64),
}

impl web::error::WebResponseError for UserError {
    fn error_response(&self, _: &web::HttpRequest) -> web::HttpResponse {
        tracing::info!(error = %self, "request rejected");

        let mut response = web::HttpResponse::build(self.status_code());
        if let UserError::TooManyRequests(retry_after) = self {
            response.set_header(http::header::RETRY_AFTER, retry_after.to_string());
        }
        response.json(&json_error_body(&self.to_string()))
    }

    fn status_code(&self) -> http::StatusCode {
        match *self {
            UserError::UrlNotFound => http::StatusCode::NOT_FOUND,
            UserError::Unauthorized => http::StatusCode::UNAUTHORIZED,
            UserError::PaymentRequired => http::StatusCode::PAYMENT_REQUIRED,
            UserError::MethodNotAllowed(_) => http::StatusCode::METHOD_NOT_ALLOWED,
            UserError::UnsupportedMediaType => http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UserError::InvalidInput(_) => http::StatusCode::BAD_REQUEST,
            UserError::TooManyRequests(_) => http::StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum ServerError {
    QueueUnavailable(#[error(not(source))] String),
}

impl ServerError {
    fn get_error_message(&self) -> String {
        match self {
            ServerError::QueueUnavailable(msg) => format!("[QueueUnavailable] {msg}"),
        }
    }
}

impl web::error::WebResponseError for ServerError {
    fn error_response(&self, _: &web::HttpRequest) -> web::HttpResponse {
        tracing::error!("{}", self.get_error_message());

        // details stay in the logs
        let message = match self {
            ServerError::QueueUnavailable(_) => "message could not be stored",
        };
        web::HttpResponse::build(self.status_code()).json(&json_error_body(message))
    }

    fn status_code(&self) -> http::StatusCode {
        http::StatusCode::INTERNAL_SERVER_ERROR
    }
}
