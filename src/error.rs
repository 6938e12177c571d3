//! Error types for the DBaaS control plane
//!
//! Every failure the API can report is a variant here. Validation failures
//! carry the exact message returned to callers; infrastructure failures wrap
//! their source and surface as 5xx.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Validation Errors
    // =========================================================================
    /// Body does not match the declared shape for the operation
    #[error("Request body has an error: doesn't match schema: {0}")]
    Schema(String),

    /// Name violates a DNS label rule family
    #[error("{0}")]
    NameViolation(String),

    /// Body is well formed but semantically invalid (url, region, spec)
    #[error("{0}")]
    Validation(String),

    /// Database cluster spec rejected by engine admission checks
    #[error("{0}")]
    ClusterSpecInvalid(String),

    /// An enforced cross-reference points at a missing resource
    #[error("{kind} '{name}' is not found")]
    ReferenceNotFound { kind: String, name: String },

    /// Credentials missing, empty, or rejected by the monitoring endpoint
    #[error("{0}")]
    Credential(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("{kind} '{name}' is not found")]
    ResourceNotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    ResourceExists { kind: String, name: String },

    #[error("{kind} '{name}' is used")]
    ResourceInUse { kind: String, name: String },

    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    // =========================================================================
    // Secret Store Errors
    // =========================================================================
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret store error: {0}")]
    SecretStore(String),

    // =========================================================================
    // Orchestrator Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    #[error("Orchestrator operation failed: {operation}: {reason}")]
    OrchestratorOperation { operation: String, reason: String },

    // =========================================================================
    // HTTP Client Errors
    // =========================================================================
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Quantity parse error: {0}")]
    QuantityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when a background orchestrator apply fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a fixed delay
    RetryAfter(Duration),
    /// Give up, the command can never succeed
    Drop,
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// HTTP status reported for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Schema(_)
            | Error::NameViolation(_)
            | Error::Validation(_)
            | Error::ClusterSpecInvalid(_)
            | Error::ReferenceNotFound { .. }
            | Error::Credential(_)
            | Error::ResourceInUse { .. }
            | Error::QuantityParse(_)
            | Error::JsonParse(_) => StatusCode::BAD_REQUEST,

            Error::ResourceNotFound { .. } | Error::ScopeNotFound(_) => StatusCode::NOT_FOUND,

            Error::ResourceExists { .. } => StatusCode::CONFLICT,

            Error::OrchestratorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Determine what the apply queue should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Kube(_) | Error::Http(_) | Error::OrchestratorUnavailable(_) => {
                ErrorAction::RetryWithBackoff
            }

            Error::OrchestratorOperation { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(5))
            }

            _ => ErrorAction::Drop,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Drop)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Http(_) | Error::OrchestratorUnavailable(_)
        )
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (
            status,
            Json(ApiErrorResponse {
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::Schema("property \"name\" is missing".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::not_found("BackupStorage", "bs-1").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::exists("BackupStorage", "bs-1").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_messages() {
        let err = Error::ReferenceNotFound {
            kind: "DatabaseCluster".into(),
            name: "not-existing-cluster".into(),
        };
        assert_eq!(err.to_string(), "DatabaseCluster 'not-existing-cluster' is not found");

        let err = Error::Schema("property \"bucket\" is unsupported".into());
        assert_eq!(
            err.to_string(),
            "Request body has an error: doesn't match schema: property \"bucket\" is unsupported"
        );
    }

    #[test]
    fn test_error_actions() {
        let err = Error::OrchestratorUnavailable("connection refused".into());
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);
        assert!(err.is_transient());

        let err = Error::OrchestratorOperation {
            operation: "apply".into(),
            reason: "conflict".into(),
        };
        assert_eq!(err.action(), ErrorAction::RetryAfter(Duration::from_secs(5)));
        assert!(err.is_retryable());
        assert!(!err.is_transient());

        let err = Error::Validation("'url' is an invalid URL".into());
        assert_eq!(err.action(), ErrorAction::Drop);
        assert!(!err.is_retryable());
    }
}
