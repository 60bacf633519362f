use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use docsync_common::ChannelMessage;
use serde_json::json;

use crate::flush::FlushError;
use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    AccessDenied,
    InvalidPath,
    InvalidMessage,
    UpdateRejected,
    StaleWrite,
    DurableStoreUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InvalidPath => "INVALID_PATH",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::UpdateRejected => "UPDATE_REJECTED",
            Self::StaleWrite => "STALE_WRITE",
            Self::DurableStoreUnavailable => "DURABLE_STORE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::InvalidPath | Self::InvalidMessage | Self::UpdateRejected => {
                StatusCode::BAD_REQUEST
            }
            Self::StaleWrite => StatusCode::CONFLICT,
            Self::DurableStoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether repeating the same request later can succeed.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::DurableStoreUnavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "request carries no user identity",
            Self::AccessDenied => "caller lacks access to this document",
            Self::InvalidPath => "document path is invalid",
            Self::InvalidMessage => "message is not valid here",
            Self::UpdateRejected => "update could not be merged",
            Self::StaleWrite => "document was modified by someone else; reload and retry",
            Self::DurableStoreUnavailable => "document storage is unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

impl From<&SessionError> for ErrorCode {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::AccessDenied => Self::AccessDenied,
            SessionError::InvalidKey(_) => Self::InvalidPath,
            SessionError::InvalidPayload(_) | SessionError::InvalidMessage(_) => Self::InvalidMessage,
            SessionError::UpdateRejected(_) => Self::UpdateRejected,
            SessionError::Flush(FlushError::StaleWrite { .. }) => Self::StaleWrite,
            SessionError::Store(_) | SessionError::Flush(FlushError::Store(_)) => {
                Self::DurableStoreUnavailable
            }
            SessionError::Flush(FlushError::Engine(_)) => Self::UpdateRejected,
            SessionError::Cache(_)
            | SessionError::Access(_)
            | SessionError::Flush(FlushError::Cache(_))
            | SessionError::Closed => Self::InternalError,
        }
    }
}

/// Wire envelope reporting `error` to the editor that caused it.
pub fn error_message(error: &SessionError) -> ChannelMessage {
    let code = ErrorCode::from(error);
    let message = match code {
        // Backend details stay in the logs.
        ErrorCode::InternalError | ErrorCode::DurableStoreUnavailable => {
            code.default_message().to_string()
        }
        _ => error.to_string(),
    };
    ChannelMessage::Error { code: code.as_str().to_string(), message, retryable: code.retryable() }
}

/// HTTP error returned before a connection is upgraded.
#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                }
            })),
        )
            .into_response()
    }
}
