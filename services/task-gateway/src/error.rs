//! HTTP error mapping
//!
//! Every failure leaves the gateway as
//! `{"code", "message", "request_id", "error": {"type"}}` where `type` is the
//! task error kind, so clients branch on throttling or moderation without
//! parsing messages.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tasks::{ErrorKind, TaskError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Request could not be decoded at all
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Task(e) => e.kind(),
            ApiError::BadRequest(_) => ErrorKind::Validation,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Throttle => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ContentModeration => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Upstream | ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Task(e) => e.retry_after(),
            ApiError::BadRequest(_) => None,
        }
    }

    /// Render the error body for a request.
    pub fn into_response_with(self, request_id: &str) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "code": status.as_u16(),
            "message": self.to_string(),
            "request_id": request_id,
            "error": {
                "type": self.kind().as_str(),
            }
        });
        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response();
        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Success envelope mirroring upstream: `{"code": 0, "message", "request_id", "data"}`.
pub fn success(request_id: &str, data: impl serde::Serialize) -> Response {
    let body = serde_json::json!({
        "code": 0,
        "message": "SUCCEED",
        "request_id": request_id,
        "data": data,
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping_per_kind() {
        let cases = [
            (TaskError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (TaskError::InvalidState("x".into()), StatusCode::BAD_REQUEST),
            (
                TaskError::Throttle {
                    message: "x".into(),
                    retry_after: None,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                TaskError::Exhausted {
                    attempts: 2,
                    message: "x".into(),
                    retry_after: None,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                TaskError::ContentModeration("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                TaskError::Upstream {
                    status: Some(400),
                    message: "x".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (TaskError::NotFound("x".into()), StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            let label = format!("{err:?}");
            assert_eq!(ApiError::from(err).status(), expected, "{label}");
        }
    }

    #[tokio::test]
    async fn throttle_response_carries_retry_after_and_type() {
        let err = ApiError::from(TaskError::Exhausted {
            attempts: 2,
            message: "parallel task over limit".into(),
            retry_after: Some(30),
        });
        let response = err.into_response_with("req_abc");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");

        let json = body_json(response).await;
        assert_eq!(json["code"], 429);
        assert_eq!(json["request_id"], "req_abc");
        assert_eq!(json["error"]["type"], "throttle_error");
        assert!(
            json["message"]
                .as_str()
                .unwrap()
                .contains("parallel task over limit")
        );
    }

    #[tokio::test]
    async fn moderation_response_has_distinct_type() {
        let response = ApiError::from(TaskError::ContentModeration("prompt flagged".into()))
            .into_response_with("req_1");
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "content_moderation_blocked");
        assert_eq!(json["code"], 422);
    }

    #[tokio::test]
    async fn success_envelope_shape() {
        let json = body_json(success("req_2", serde_json::json!({"task_id": "t-1"}))).await;
        assert_eq!(json["code"], 0);
        assert_eq!(json["message"], "SUCCEED");
        assert_eq!(json["request_id"], "req_2");
        assert_eq!(json["data"]["task_id"], "t-1");
    }
}
