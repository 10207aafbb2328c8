//! Error taxonomy for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::backend::BackendError;
use crate::device::DeviceError;
use crate::scan::ScanError;
use crate::setup::SetupError;
use crate::tuner::instance::InstanceError;

/// Failures a handler can surface to a client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The device is locked by another operation; not retried.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// The backend process is unreachable or misbehaving.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Validation(String),

    #[error("admin token required")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<InstanceError> for ApiError {
    fn from(e: InstanceError) -> Self {
        match e {
            InstanceError::DeviceBusy { .. } => ApiError::Conflict(e.to_string()),
            InstanceError::NoActiveInstance(_) => ApiError::NotFound(e.to_string()),
            InstanceError::StartTimeout(_) => ApiError::Timeout(e.to_string()),
            InstanceError::LaunchFailed(_) => ApiError::Upstream(e.to_string()),
            InstanceError::Backend(e) => e.into(),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout => ApiError::Timeout(e.to_string()),
            BackendError::Unreachable(_) | BackendError::Status(_) | BackendError::Decode(_) => {
                ApiError::Upstream(e.to_string())
            }
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::DeviceBusy { .. } => ApiError::Conflict(e.to_string()),
            ScanError::Backend(_) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::UnknownIndex(_) => ApiError::NotFound(e.to_string()),
            DeviceError::ProbeFailed(_) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl From<SetupError> for ApiError {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::UnknownDevice(_) | SetupError::UnknownTransponder { .. } => {
                ApiError::NotFound(e.to_string())
            }
            SetupError::Persist(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::lock::LockPurpose;

    #[test]
    fn status_mapping() {
        let busy: ApiError = InstanceError::DeviceBusy {
            device_index: 0,
            purpose: LockPurpose::Scanning,
        }
        .into();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let missing: ApiError = InstanceError::NoActiveInstance(2).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let timeout: ApiError = BackendError::Timeout.into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let down: ApiError = BackendError::Unreachable("refused".into()).into();
        assert_eq!(down.status(), StatusCode::BAD_GATEWAY);

        let invalid = ApiError::Validation("bad gain".into());
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
