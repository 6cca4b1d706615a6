//! Error types for directory authentication.
//!
//! Failures reaching the directory (connection, privileged bind, search) are errors. A rejected
//! end-user credential is not: it surfaces as `Ok(false)` from the authenticator, so hosts can
//! keep "authentication unavailable" apart from "authentication failed".

use thiserror::Error;

/// Main error type for directory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The directory server is unreachable or the connection handle is unusable.
    #[error("Directory connection failed ({code}): {message}")]
    Connection {
        /// Result code reported by the directory library (0 when the server was never reached)
        code: u32,
        /// Diagnostic message
        message: String,
    },

    /// A bind was rejected by the directory.
    #[error("Directory bind failed ({code}): {message}")]
    Bind {
        /// LDAP result code
        code: u32,
        /// Diagnostic message
        message: String,
    },

    /// A search failed at the protocol level.
    #[error("Directory search failed ({code}): {message}")]
    Search {
        /// LDAP result code
        code: u32,
        /// Diagnostic message
        message: String,
    },

    /// Operation timed out
    #[error("Directory operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed distinguished name
    #[error("Invalid distinguished name: {0}")]
    InvalidDn(String),
}

/// Specialized result type for directory operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds a connection error from a library failure that carries no result code.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            code: 0,
            message: message.into(),
        }
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Bind { .. } => "BIND_ERROR",
            Self::Search { .. } => "SEARCH_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidDn(_) => "INVALID_DN",
        }
    }

    /// Returns the result code reported by the directory library, if any.
    #[must_use]
    pub const fn directory_code(&self) -> Option<u32> {
        match self {
            Self::Connection { code, .. } | Self::Bind { code, .. } | Self::Search { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Returns true when the directory itself could not serve the request.
    ///
    /// Hosts should report these as "authentication unavailable" rather than as rejected
    /// credentials.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Bind { .. } | Self::Search { .. } | Self::Timeout(_)
        )
    }

    /// Returns true if this error should be logged at error level.
    ///
    /// Timeouts are usually transient and only warrant a warning.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Bind { .. } | Self::Search { .. } | Self::Config(_)
        )
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid directory URI: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid directory configuration: {err}"))
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Config(format!("invalid directory configuration: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_error() -> Error {
        Error::Bind {
            code: 49,
            message: "invalid credentials".to_string(),
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::connection("refused").error_code(), "CONNECTION_ERROR");
        assert_eq!(bind_error().error_code(), "BIND_ERROR");
        assert_eq!(
            Error::Search {
                code: 32,
                message: "no such object".to_string()
            }
            .error_code(),
            "SEARCH_ERROR"
        );
        assert_eq!(Error::Timeout("search".to_string()).error_code(), "TIMEOUT");
        assert_eq!(Error::Config("test".to_string()).error_code(), "CONFIG_ERROR");
        assert_eq!(Error::InvalidDn("test".to_string()).error_code(), "INVALID_DN");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            bind_error().to_string(),
            "Directory bind failed (49): invalid credentials"
        );
        assert_eq!(
            Error::connection("connection refused").to_string(),
            "Directory connection failed (0): connection refused"
        );
    }

    #[test]
    fn test_unavailable_vs_configuration() {
        assert!(Error::connection("down").is_unavailable());
        assert!(bind_error().is_unavailable());
        assert!(Error::Timeout("bind".to_string()).is_unavailable());
        assert!(!Error::Config("bad uri".to_string()).is_unavailable());
        assert!(!Error::InvalidDn("cn=".to_string()).is_unavailable());
    }

    #[test]
    fn test_directory_code() {
        assert_eq!(bind_error().directory_code(), Some(49));
        assert_eq!(Error::Timeout("x".to_string()).directory_code(), None);
    }

    #[test]
    fn test_should_log() {
        assert!(Error::connection("down").should_log());
        assert!(bind_error().should_log());
        assert!(Error::Search {
            code: 1,
            message: "operations error".to_string()
        }
        .should_log());
        assert!(Error::Config("test".to_string()).should_log());
        assert!(!Error::Timeout("test".to_string()).should_log());
        assert!(!Error::InvalidDn("test".to_string()).should_log());
    }

    #[test]
    fn test_from_url_parse_error() {
        let err = url::Url::parse("not a url").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Config(_)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{invalid json}").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Config(_)));
    }
}
