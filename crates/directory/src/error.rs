use thiserror::Error;

/// Failures talking to a directory service.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The service answered with a non-success status. `message` is the raw
    /// response body, e.g. `{"code":40004,"description":"...","error_code":"CF-SpaceNotFound"}`.
    #[error("{service} Failure ({code}): {message}")]
    Failure {
        service: &'static str,
        code: u16,
        message: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed directory response: {0}")]
    Decode(String),
}

impl DirectoryError {
    pub fn cloud_controller(code: u16, message: impl Into<String>) -> Self {
        DirectoryError::Failure {
            service: "CloudController",
            code,
            message: message.into(),
        }
    }

    pub fn uaa(code: u16, message: impl Into<String>) -> Self {
        DirectoryError::Failure {
            service: "UAA",
            code,
            message: message.into(),
        }
    }

    /// HTTP status of a failure response, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            DirectoryError::Failure { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}
