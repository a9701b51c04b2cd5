use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Config
    #[error("config not found (searched: {searched:?})")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("config parse error in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    // Protocol
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("expected HTTP {expected} but got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },

    #[error("missing Location header on redirect")]
    MissingLocation,

    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    // Transport
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("outbound call failed: {0}")]
    Outbound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigNotFound { .. } | Self::ConfigParse { .. } | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            Self::InvalidUrl(_) | Self::UnknownUser(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }

            Self::UnexpectedStatus { .. } | Self::MissingLocation => StatusCode::BAD_GATEWAY,

            Self::ContractViolation(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,

            Self::Http(_) | Self::Outbound(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short, stable error code for response bodies.
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound { .. } => "config_not_found",
            Self::ConfigParse { .. } => "config_parse_error",
            Self::Config(_) => "config_error",
            Self::InvalidUrl(_) => "invalid_url",
            Self::UnknownUser(_) => "unknown_user",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::MissingLocation => "missing_location",
            Self::ContractViolation(_) => "contract_violation",
            Self::Http(_) => "http_error",
            Self::Outbound(_) => "outbound_error",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let detail = if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            None
        } else {
            Some(self.to_string())
        };

        let body = ErrorBody {
            error: self.error_code().to_string(),
            detail,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
