use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::content::ContentError;
use crate::gate::MagicLinkError;
use crate::license::LicenseError;
use crate::notify::DeliveryError;

/// Every failure an HTTP handler can report.
///
/// Gate failures (delivery, license, magic link) are reported in-band as
/// `200 {ok:false, error}`; the client decides what to show. Content
/// failures use the `{status, message}` shape of the content endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Signature(#[from] LicenseError),
    #[error(transparent)]
    MagicLink(#[from] MagicLinkError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("internal error")]
    Storage(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Delivery(_) | Self::Signature(_) | Self::MagicLink(_) => StatusCode::OK,
            Self::Content(e) => content_status(e),
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn content_status(e: &ContentError) -> StatusCode {
    match e {
        ContentError::Unauthorized => StatusCode::UNAUTHORIZED,
        ContentError::MissingPage
        | ContentError::InvalidPage
        | ContentError::InvalidJson
        | ContentError::Schema(_) => StatusCode::BAD_REQUEST,
        ContentError::NotFound => StatusCode::NOT_FOUND,
        ContentError::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Content(ContentError::NotFound) => {
                (status, Json(json!({"error": "Page not found"}))).into_response()
            }
            Self::Content(e) => (
                status,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
                .into_response(),
            Self::Storage(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    status,
                    Json(json!({"ok": false, "error": "internal error"})),
                )
                    .into_response()
            }
            other => (
                status,
                Json(json!({"ok": false, "error": other.to_string()})),
            )
                .into_response(),
        }
    }
}
