use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported model: {0}")]
    UnknownModel(String),

    #[error("Provider error ({model}): {message}")]
    Provider {
        model: String,
        message: String,
        status_code: Option<u16>,
    },

    #[error("Empty response from {0}")]
    EmptyResponse(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Request aborted by caller")]
    Aborted,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown_model(key: impl Into<String>) -> Self {
        Self::UnknownModel(key.into())
    }

    pub fn provider(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn provider_with_status(
        model: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self::Provider {
            model: model.into(),
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    pub fn empty_response(model: impl Into<String>) -> Self {
        Self::EmptyResponse(model.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors caused by the caller's input, detected before any provider call.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownModel(_))
    }

    /// Status code the provider answered with, if the failure came from one.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Self::Provider { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_client_errors() {
        assert!(Error::validation("empty").is_client_error());
        assert!(Error::unknown_model("zzz").is_client_error());
    }

    #[test]
    fn provider_side_errors_are_not_client_errors() {
        assert!(!Error::provider("@cf/x", "boom").is_client_error());
        assert!(!Error::empty_response("@cf/x").is_client_error());
        assert!(!Error::Aborted.is_client_error());
    }

    #[test]
    fn provider_status_is_exposed() {
        let err = Error::provider_with_status("@cf/x", "bad input", 400);
        assert_eq!(err.provider_status(), Some(400));
        assert_eq!(Error::http("reset").provider_status(), None);
    }
}
