//! Certificate installation errors.

use thiserror::Error;

/// Errors that can occur while binding a certificate.
#[derive(Debug, Error)]
pub enum CertError {
    /// The binding prefix has no usable `ip:port`.
    #[error("Invalid binding prefix '{prefix}': {reason}")]
    InvalidPrefix {
        /// The prefix as given.
        prefix: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A bundle field is missing or malformed.
    #[error("Invalid certificate field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A tool could not be started.
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A tool ran and reported failure.
    #[error("'{program}' exited with status {}: {}", status.map_or_else(|| "unknown".to_string(), |s| s.to_string()), stderr.trim())]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit code, if the process exited normally.
        status: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
}

impl CertError {
    /// Creates an invalid prefix error.
    pub fn invalid_prefix(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPrefix {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = CertError::CommandFailed {
            program: "netsh".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "access denied\r\n".to_string(),
        };
        assert_eq!(err.to_string(), "'netsh' exited with status 1: access denied");

        let err = CertError::CommandFailed {
            program: "certutil".to_string(),
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "'certutil' exited with status unknown: ");
    }

    #[test]
    fn test_invalid_prefix_display() {
        let err = CertError::invalid_prefix("https://", "missing host");
        assert_eq!(err.to_string(), "Invalid binding prefix 'https://': missing host");
    }
}
