//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use netbill_billing::BillingError;
use netbill_common::{CatalogError, Classify, ErrorKind, RepositoryError};

use crate::models::ApiResponse;

/// Error returned by a handler
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Gateway => StatusCode::BAD_GATEWAY,
            ErrorKind::Connectivity | ErrorKind::Protocol => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

macro_rules! from_classified {
    ($($error:ty),*) => {
        $(impl From<$error> for ApiError {
            fn from(e: $error) -> Self {
                Self::new(e.kind(), e.to_string())
            }
        })*
    };
}

from_classified!(BillingError, CatalogError, RepositoryError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(kind = %self.kind, error = %self.message, "request failed");
        }
        let body = ApiResponse::<()>::error(self.kind.as_str(), &self.message);
        (status, Json(body)).into_response()
    }
}
