//! HTTP error mapping.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use super::dto::{ErrorBody, ErrorDetail};
use crate::attachment::AttachmentError;
use crate::error::Error;
use crate::model::Status;

#[derive(Debug)]
pub enum ApiError {
    /// Missing or wrong pre-shared key.
    Unauthorized,
    /// Body, path or query could not be parsed.
    Malformed(String),
    Store(Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Store(e) => match e {
                Error::Validation(_) | Error::Attachment(_) => StatusCode::BAD_REQUEST,
                Error::NotFound(_) => StatusCode::NOT_FOUND,
                Error::InvalidTransition { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Cause tag operators and clients branch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Malformed(_) => "malformed_request",
            Self::Store(e) => match e {
                Error::Validation(_) => "validation",
                Error::Attachment(AttachmentError::TooLarge { .. }) => "attachment_too_large",
                Error::Attachment(AttachmentError::EncodingTimeout(_)) => {
                    "attachment_encoding_timeout"
                }
                Error::Attachment(AttachmentError::ReadError(_)) => "attachment_read_error",
                Error::Attachment(AttachmentError::InvalidEncoding(_)) => {
                    "attachment_invalid_encoding"
                }
                Error::NotFound(_) => "not_found",
                Error::InvalidTransition { .. } => "invalid_transition",
                Error::Conflict(_) => "conflict",
                Error::StorageUnavailable(_) => "storage_unavailable",
                Error::Config(_) => "not_configured",
                _ => "internal",
            },
        }
    }

    fn transition(&self) -> Option<(Status, Status)> {
        match self {
            Self::Store(Error::InvalidTransition { from, to }) => Some((*from, *to)),
            _ => None,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Store(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        Self::Malformed(r.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(r: PathRejection) -> Self {
        Self::Malformed(r.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(r: QueryRejection) -> Self {
        Self::Malformed(r.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Unauthorized => "missing or invalid api key".to_string(),
            Self::Malformed(m) => m.clone(),
            // Database and transport details stay in the log.
            Self::Store(e) if self.code() == "internal" => {
                error!(error = %e, "request failed");
                "internal error".to_string()
            }
            Self::Store(e) => e.to_string(),
        };
        let (from, to) = self.transition().unzip();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message,
                from,
                to,
            },
        };
        (status, Json(body)).into_response()
    }
}
