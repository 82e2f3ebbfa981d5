use std::fmt::{Debug, Display};

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

/// Controls whether store and upstream error messages are included verbatim in
/// response bodies. When unset (or false), system errors render a generic message.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

/// Seconds a client should wait before retrying after a transient store failure.
pub const STORE_RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    /// Transient backend failures; the caller may retry the whole request.
    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    CredentialNotFound {
        credential_id: String,
    },
    DecisionTimeout {
        timeout_ms: u64,
    },
    InvalidRequest {
        message: String,
    },
    Serialization {
        message: String,
    },
    Store {
        message: String,
    },
    StoreTimeout {
        operation: String,
        timeout_ms: u64,
    },
    Upstream {
        message: String,
        status_code: Option<StatusCode>,
    },
    UpstreamNotConfigured {
        service_class: String,
    },
}

impl ErrorDetails {
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::CredentialNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::DecisionTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::Store { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::Upstream { .. } => tracing::Level::WARN,
            ErrorDetails::UpstreamNotConfigured { .. } => tracing::Level::ERROR,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CredentialNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::DecisionTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::StoreTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Upstream { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::UpstreamNotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Store { .. }
                | ErrorDetails::StoreTimeout { .. }
                | ErrorDetails::DecisionTimeout { .. }
        )
    }

    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::InvalidRequest { .. } => "invalid_request_error",
            ErrorDetails::CredentialNotFound { .. } => "not_found_error",
            ErrorDetails::Upstream { .. } | ErrorDetails::UpstreamNotConfigured { .. } => {
                "upstream_error"
            }
            ErrorDetails::Store { .. }
            | ErrorDetails::StoreTimeout { .. }
            | ErrorDetails::DecisionTimeout { .. } => "service_unavailable",
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. } => "internal_error",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ErrorDetails::AppState { .. } => "app_state",
            ErrorDetails::Config { .. } => "config",
            ErrorDetails::CredentialNotFound { .. } => "credential_not_found",
            ErrorDetails::DecisionTimeout { .. } => "decision_timeout",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::Serialization { .. } => "serialization",
            ErrorDetails::Store { .. } => "store_unavailable",
            ErrorDetails::StoreTimeout { .. } => "store_timeout",
            ErrorDetails::Upstream { .. } => "upstream",
            ErrorDetails::UpstreamNotConfigured { .. } => "upstream_not_configured",
        }
    }

    /// Message safe to show a client. Backend details stay in the logs unless debug is on.
    fn public_message(&self) -> String {
        if debug_enabled() {
            return self.to_string();
        }
        match self {
            ErrorDetails::Store { .. } | ErrorDetails::StoreTimeout { .. } => {
                "Service temporarily unavailable. Try again shortly".to_string()
            }
            ErrorDetails::DecisionTimeout { .. } => {
                "Authorization timed out. Try again shortly".to_string()
            }
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. } => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::CredentialNotFound { credential_id } => {
                write!(f, "Credential not found: {credential_id}")
            }
            ErrorDetails::DecisionTimeout { timeout_ms } => {
                write!(f, "Authorization decision exceeded {timeout_ms}ms")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::Serialization { message } => {
                write!(f, "Error serializing or deserializing stored data: {message}")
            }
            ErrorDetails::Store { message } => write!(f, "Backing store error: {message}"),
            ErrorDetails::StoreTimeout {
                operation,
                timeout_ms,
            } => {
                write!(
                    f,
                    "Backing store operation `{operation}` timed out after {timeout_ms}ms"
                )
            }
            ErrorDetails::Upstream {
                message,
                status_code,
            } => match status_code {
                Some(status_code) => write!(f, "Upstream returned {status_code}: {message}"),
                None => write!(f, "Error contacting upstream: {message}"),
            },
            ErrorDetails::UpstreamNotConfigured { service_class } => {
                write!(f, "No upstream configured for service class `{service_class}`")
            }
        }
    }
}

impl Error {
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let body = json!({
            "error": {
                "message": self.0.public_message(),
                "type": self.0.error_type(),
                "code": self.0.error_code(),
            }
        });
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response. Retryable errors carry `Retry-After`.
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if self.is_retryable() {
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                HeaderValue::from(STORE_RETRY_AFTER_SECS),
            );
        }
        response
    }
}
