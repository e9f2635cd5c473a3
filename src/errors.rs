use crate::services::{
    access_token::TokenError,
    cluster::{LeaseError, PlacementError},
    delivery::DeliveryError,
    metadata::MetadataError,
    security::ValidationError,
    storage::StorageError,
    upload::UploadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

/// An error ready to go back to the client: HTTP status, a stable machine
/// readable kind, and a message. Backend details are logged, never returned.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", msg)
    }

    pub fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "authentication required",
        )
    }

    /// Every signed-link failure looks the same to the client.
    pub fn access_denied() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "access_denied",
            "invalid or expired link",
        )
    }

    pub fn file_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "file_not_found", "file not found")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            },
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "unhandled error");
        AppError::internal("internal server error")
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidObjectKey => AppError::invalid_request("invalid object key"),
            StorageError::ObjectNotFound(_) => {
                AppError::new(StatusCode::NOT_FOUND, "object_not_found", "object not found")
            }
            StorageError::ChecksumMismatch {
                expected, actual, ..
            } => AppError::new(
                StatusCode::BAD_REQUEST,
                "checksum_mismatch",
                format!("checksum mismatch: declared {expected}, computed {actual}"),
            ),
            StorageError::BackendWriteFailed {
                key,
                attempts,
                reason,
            } => {
                error!(key = %key, attempts, reason = %reason, "storage write failed");
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "backend_write_failed",
                    "storage backend write failed",
                )
            }
            StorageError::BackendReadFailed { key, reason } => {
                error!(key = %key, reason = %reason, "storage read failed");
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "backend_read_failed",
                    "storage backend read failed",
                )
            }
            StorageError::SourceInterrupted(e) => {
                warn!(error = %e, "upload body interrupted");
                AppError::invalid_request("upload body ended unexpectedly")
            }
        }
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::FileNotFound => AppError::file_not_found(),
            other => {
                error!(error = %other, "metadata store error");
                AppError::internal("metadata store error")
            }
        }
    }
}

impl From<PlacementError> for AppError {
    fn from(err: PlacementError) -> Self {
        AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_nodes_configured",
            err.to_string(),
        )
    }
}

impl From<LeaseError> for AppError {
    fn from(err: LeaseError) -> Self {
        error!(error = %err, "lease store error");
        AppError::internal("cluster coordination unavailable")
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidClaim(_) => AppError::invalid_request(err.to_string()),
            _ => {
                warn!(reason = %err, "signed link rejected");
                AppError::access_denied()
            }
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::invalid_request(err.to_string())
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Metadata(e) => e.into(),
            DeliveryError::Storage(e) => e.into(),
            DeliveryError::StreamAborted { bytes_sent, reason } => {
                error!(bytes_sent, reason = %reason, "download aborted");
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "backend_read_failed",
                    "storage backend read failed",
                )
            }
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Invalid(e) => e.into(),
            UploadError::Rejected(reason) => {
                AppError::invalid_request(format!("file failed security checks: {reason}"))
            }
            UploadError::Placement(e) => e.into(),
            UploadError::Storage(e) => e.into(),
            UploadError::Metadata(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(err: impl Into<AppError>) -> (StatusCode, serde_json::Value) {
        let response = err.into().into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn body_shape() {
        let (status, body) = body_json(AppError::file_not_found()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({"error": {"kind": "file_not_found", "message": "file not found"}, "status": 404})
        );
    }

    #[tokio::test]
    async fn backend_details_stay_in_logs() {
        let (status, body) = body_json(StorageError::BackendWriteFailed {
            key: "user/1/uploads/x".into(),
            attempts: 3,
            reason: "s3 said secret-internal-thing".into(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["kind"], "backend_write_failed");
        assert!(!body.to_string().contains("secret-internal-thing"));
    }

    #[tokio::test]
    async fn kinds_and_statuses() {
        let cases: Vec<(AppError, StatusCode, &str)> = vec![
            (
                StorageError::ChecksumMismatch {
                    key: "k".into(),
                    expected: "a".into(),
                    actual: "b".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
                "checksum_mismatch",
            ),
            (
                StorageError::ObjectNotFound("k".into()).into(),
                StatusCode::NOT_FOUND,
                "object_not_found",
            ),
            (
                PlacementError::NoNodesConfigured.into(),
                StatusCode::SERVICE_UNAVAILABLE,
                "no_nodes_configured",
            ),
            (TokenError::Expired.into(), StatusCode::UNAUTHORIZED, "access_denied"),
            (TokenError::BadSignature.into(), StatusCode::UNAUTHORIZED, "access_denied"),
            (
                MetadataError::FileNotFound.into(),
                StatusCode::NOT_FOUND,
                "file_not_found",
            ),
            (
                UploadError::Invalid(ValidationError::Empty).into(),
                StatusCode::BAD_REQUEST,
                "invalid_request",
            ),
            (AppError::unauthenticated(), StatusCode::UNAUTHORIZED, "unauthenticated"),
        ];

        for (err, status, kind) in cases {
            assert_eq!((err.status, err.kind), (status, kind), "{err}");
        }
    }

    #[tokio::test]
    async fn rejected_links_are_indistinguishable() {
        let mut bodies = Vec::new();
        for err in [TokenError::Malformed, TokenError::BadSignature, TokenError::Expired] {
            let (status, body) = body_json(err).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            bodies.push(body);
        }
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[1], bodies[2]);
        assert_eq!(bodies[0]["error"]["message"], "invalid or expired link");

        let (status, body) = body_json(TokenError::InvalidClaim("user id")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_request");
    }
}
