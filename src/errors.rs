use crate::cluster::ClusterError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),
    #[error("sandbox {name} is not running (phase: {phase})")]
    SandboxNotRunning { name: String, phase: String },
    #[error("invalid {field} quantity '{value}': {reason}")]
    InvalidQuantity {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to provision home storage {volume}: {source}")]
    VolumeProvisioning {
        volume: String,
        #[source]
        source: ClusterError,
    },
    #[error("sandbox {name} did not become ready within {waited:?}")]
    ReadinessTimeout { name: String, waited: Duration },
    #[error("sandbox {name} entered phase {phase} before becoming ready")]
    SandboxFailed { name: String, phase: String },
    #[error("timed out after {waited:?} waiting for sandbox {name} to terminate")]
    TerminationTimeout { name: String, waited: Duration },
    #[error("session {0} already has an active connection")]
    ExecLocked(String),
    #[error("exec stream error: {0}")]
    Exec(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ShellError {
    fn into_response(self) -> Response {
        let status = match self {
            ShellError::SessionNotFound(_) | ShellError::SandboxNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ShellError::SandboxNotRunning { .. } => StatusCode::CONFLICT,
            ShellError::ExecLocked(_) => StatusCode::CONFLICT,
            ShellError::ReadinessTimeout { .. } | ShellError::TerminationTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ShellError::Cluster(ClusterError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ShellError::VolumeProvisioning { .. }
            | ShellError::SandboxFailed { .. }
            | ShellError::Exec(_)
            | ShellError::Cluster(_) => StatusCode::BAD_GATEWAY,
            ShellError::InvalidQuantity { .. } | ShellError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let code = match status.as_u16() {
            404 => "not_found",
            409 => "conflict",
            502 => "cluster_error",
            504 => "timeout",
            500 => "internal_error",
            _ => "error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type ShellResult<T> = Result<T, ShellError>;
