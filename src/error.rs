use std::time::Duration;
use thiserror::Error;

/// Image payload could not be turned into a pixel grid.
/// Always treated as a quality rejection, never as a crash.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),

    #[error("image payload is empty")]
    Empty,
}

/// Failure talking to a chat provider (Groq, Ollama).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to {provider} failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("malformed response from {provider}: {reason}")]
    Malformed {
        provider: &'static str,
        reason: String,
    },

    #[error("{provider} did not answer within {timeout:?}")]
    Timeout {
        provider: &'static str,
        timeout: Duration,
    },
}

/// Failure of a binary classification call. The moderation pipeline decides
/// per stage whether this admits or rejects.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("classifier returned an empty label")]
    EmptyLabel,
}

/// Startup configuration problem. Fatal, never handled per request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to read reference document {path}: {source}")]
    ReferenceDoc {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failing_piece() {
        let err = ConfigError::Missing("GROQ_API_KEY");
        assert_eq!(err.to_string(), "missing required setting GROQ_API_KEY");

        let err = ClassifierError::Timeout(Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));

        let err: ClassifierError = ProviderError::Status {
            provider: "groq",
            status: 503,
            body: "overloaded".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "groq returned HTTP 503: overloaded");
    }
}
