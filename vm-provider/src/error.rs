//! Error types for cloud provider operations.

use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;
use tracing::{debug, warn};

/// Error code the provider returns when a dry-run request would have succeeded
pub const DRY_RUN_AUTHORIZED: &str = "DryRunOperation";

/// Errors that can occur while talking to the cloud provider.
///
/// `Display` of an [`ProviderError::Api`] is the provider's own message so it
/// can be stored verbatim on a failed instance record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{message}")]
    Api {
        code: Option<String>,
        message: String,
    },

    #[error("Provider response missing {0}")]
    MissingField(&'static str),

    #[error("Provider request failed: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Build an API error from a provider error code and message
    pub fn api(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Provider error code, when the provider returned one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        match err.as_service_error() {
            Some(service) => {
                let message = service
                    .message()
                    .map(str::to_string)
                    .or_else(|| service.code().map(str::to_string))
                    .unwrap_or_else(|| service.to_string());
                Self::api(service.code(), message)
            }
            None => Self::Transport(DisplayErrorContext(&err).to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Outcome of a dry-run request: only the provider's dry-run signal counts
/// as authorized. A dry run never executes, so plain success is rejected too.
pub(crate) fn dry_run_authorized(result: Result<()>) -> bool {
    match result {
        Ok(()) => {
            warn!("Dry-run request returned success instead of the dry-run signal");
            false
        }
        Err(err) => {
            let authorized = err.code() == Some(DRY_RUN_AUTHORIZED);
            if !authorized {
                debug!(error = %err, "Credential validation rejected");
            }
            authorized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_displays_provider_message() {
        let err = ProviderError::api(Some("ResourceLimitExceeded"), "quota exceeded");
        assert_eq!(err.to_string(), "quota exceeded");
        assert_eq!(err.code(), Some("ResourceLimitExceeded"));
    }

    #[test]
    fn test_only_dry_run_signal_authorizes() {
        assert!(dry_run_authorized(Err(ProviderError::api(
            Some("DryRunOperation"),
            "Request would have succeeded, but DryRun flag is set."
        ))));
        assert!(!dry_run_authorized(Err(ProviderError::api(
            Some("UnauthorizedOperation"),
            "You are not authorized to perform this operation."
        ))));
        assert!(!dry_run_authorized(Err(ProviderError::api(
            Some("AuthFailure"),
            "DryRunOperation"
        ))));
        assert!(!dry_run_authorized(Err(ProviderError::Transport(
            "dns error".to_string()
        ))));
        assert!(!dry_run_authorized(Ok(())));
    }

    #[test]
    fn test_non_api_errors_have_no_code() {
        assert_eq!(ProviderError::MissingField("instance id").code(), None);
        assert_eq!(
            ProviderError::MissingField("instance id").to_string(),
            "Provider response missing instance id"
        );
    }
}
