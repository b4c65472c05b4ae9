use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("account store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out during account rotation after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Auth(AuthError::RefreshFailed(_)) => {
                Some("Run 'codexmux login' to re-authenticate")
            }
            Error::Auth(AuthError::IdentityMissing) => {
                Some("Run 'codexmux login' to re-authenticate")
            }
            Error::Auth(AuthError::OAuthFailed(_)) => {
                Some("Check your internet connection and try again")
            }
            Error::Api(ApiError::AllAccountsUnavailable { .. }) => {
                Some("Wait for the rate limit to reset or add another account")
            }
            Error::Store(StoreError::Corrupt(_)) => {
                Some("The corrupt file was quarantined; run 'codexmux login' to start fresh")
            }
            Error::Store(StoreError::LockTimeout(_)) => {
                Some("Another process is holding the account store lock; retry shortly")
            }
            Error::Timeout(_) => Some("Check your internet connection or try again"),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("account identity could not be derived from the access token")]
    IdentityMissing,

    #[error("OAuth flow failed: {0}")]
    OAuthFailed(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("All {count} account(s) unavailable. Next reset in approximately {next_reset}")]
    AllAccountsUnavailable { count: usize, next_reset: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("account store is corrupt: {0}")]
    Corrupt(String),

    #[error("could not acquire account store lock within {0:?}")]
    LockTimeout(Duration),

    #[error("account index {index} out of range (valid: 1-{max})")]
    IndexOutOfRange { index: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_suggestion_refresh_failed() {
        let err = Error::Auth(AuthError::RefreshFailed("test".to_string()));
        assert!(err.suggestion().is_some());
        assert!(err.suggestion().unwrap().contains("login"));
    }

    #[test]
    fn test_error_suggestion_identity_missing() {
        let err = Error::Auth(AuthError::IdentityMissing);
        assert!(err.suggestion().is_some());
        assert!(err.suggestion().unwrap().contains("login"));
    }

    #[test]
    fn test_error_suggestion_all_accounts() {
        let err = Error::Api(ApiError::AllAccountsUnavailable {
            count: 2,
            next_reset: "1m30s".to_string(),
        });
        assert!(err.suggestion().is_some());
        assert!(err.suggestion().unwrap().contains("account"));
    }

    #[test]
    fn test_error_no_suggestion() {
        let err = Error::Http("connection failed".to_string());
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn test_store_error_display_includes_range() {
        let err = StoreError::IndexOutOfRange { index: 7, max: 3 };
        let display = format!("{}", err);
        assert!(display.contains("7"));
        assert!(display.contains("1-3"));
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::AllAccountsUnavailable {
            count: 3,
            next_reset: "45s".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.starts_with("All 3 account(s) unavailable."));
        assert!(display.contains("45s"));
    }
}
