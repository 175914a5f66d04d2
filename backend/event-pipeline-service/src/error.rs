use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use event_queue::QueueError;
use idempotent_consumer::IdempotencyError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        missing: Vec<String>,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Queue store unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Queue store failed after accepting {accepted} events: {source}")]
    BatchInterrupted {
        accepted: usize,
        #[source]
        source: QueueError,
    },

    #[error("Idempotency ledger error: {0}")]
    Ledger(#[from] IdempotencyError),

    #[error("Broker connection error: {0}")]
    Broker(#[from] anyhow::Error),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Worker {worker} failed: {reason}")]
    Worker { worker: String, reason: String },
}

impl PipelineError {
    pub fn missing_fields(missing: Vec<String>) -> Self {
        PipelineError::Validation {
            message: format!("Missing required fields: {}", missing.join(", ")),
            missing,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<usize>,
}

impl ResponseError for PipelineError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let mut body = ErrorResponse {
            error: self.to_string(),
            code: code.as_u16(),
            missing: Vec::new(),
            accepted: None,
        };

        match self {
            PipelineError::Validation { message, missing } => {
                body.error = message.clone();
                body.missing = missing.clone();
            }
            PipelineError::BadRequest(msg) => body.error = msg.clone(),
            PipelineError::BatchInterrupted { accepted, .. } => body.accepted = Some(*accepted),
            _ => {}
        }

        HttpResponse::build(code).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::Validation { .. } | PipelineError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Queue(_)
            | PipelineError::BatchInterrupted { .. }
            | PipelineError::Ledger(_)
            | PipelineError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PipelineError::missing_fields(vec!["identifier".into()]).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::Queue(QueueError::Unavailable("down".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PipelineError::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[actix_web::test]
    async fn test_validation_body_lists_missing_fields() {
        let err = PipelineError::missing_fields(vec!["identifier".into(), "type".into()]);
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["code"], 400);
        assert_eq!(json["missing"], serde_json::json!(["identifier", "type"]));
        assert!(json.get("accepted").is_none());
    }
}
