use reqwest::StatusCode;
use snafu::Snafu;

/// Classified failure from the offer service.
///
/// Every variant carries the human-readable message that is relayed to the
/// client in an `{action, error}` reply.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
pub enum BackendError {
    #[snafu(display("not found: {}", message))]
    NotFound { message: String },

    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("already exists: {}", message))]
    AlreadyExists { message: String },

    #[snafu(display("permission denied: {}", message))]
    PermissionDenied { message: String },

    #[snafu(display("unauthenticated: {}", message))]
    Unauthenticated { message: String },

    #[snafu(display("offer service unavailable: {}", message))]
    Unavailable { message: String },

    #[snafu(display("internal error: {}", message))]
    Internal { message: String },
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

impl BackendError {
    /// Message suitable for showing to the client.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound { message }
            | Self::InvalidArgument { message }
            | Self::AlreadyExists { message }
            | Self::PermissionDenied { message }
            | Self::Unauthenticated { message }
            | Self::Unavailable { message }
            | Self::Internal { message } => message,
        }
    }

    /// Short classification, used as a structured log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::AlreadyExists { .. } => "already_exists",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::Unavailable { .. } => "unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    pub(crate) fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::NOT_FOUND => Self::NotFound { message },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::InvalidArgument { message }
            }
            StatusCode::CONFLICT => Self::AlreadyExists { message },
            StatusCode::UNAUTHORIZED => Self::Unauthenticated { message },
            StatusCode::FORBIDDEN => Self::PermissionDenied { message },
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Self::Unavailable { message },
            _ => Self::Internal { message },
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Internal {
                message: format!("malformed response from offer service: {err}"),
            }
        } else {
            BackendError::Unavailable {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = BackendError::from_status(StatusCode::NOT_FOUND, "offer not found".into());
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.message(), "offer not found");

        assert!(matches!(
            BackendError::from_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()),
            BackendError::InvalidArgument { .. }
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            BackendError::Unavailable { .. }
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::IM_A_TEAPOT, String::new()),
            BackendError::Internal { .. }
        ));
    }
}
