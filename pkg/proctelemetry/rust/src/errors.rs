// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The provider refused the query for lack of privileges.
    #[error("permission denied: {context}")]
    PermissionDenied { context: String },

    /// The query is not available on this platform.
    #[error("not implemented: {operation}")]
    NotImplemented { operation: String },

    /// Any other provider failure, including a process that went away.
    #[error("transient failure: {context}")]
    TransientFailure { context: String },

    #[error("too many temporary provider handles in use (limit {limit})")]
    ResourceExhausted { limit: usize },

    #[error("timed out after {timeout:?} waiting for the {resource} lock")]
    LockTimeout {
        resource: &'static str,
        timeout: Duration,
    },

    /// The provider handle could not be opened, so no query was made.
    #[error("native telemetry handle unavailable: {context}")]
    HandleUnavailable { context: String },

    #[error("native telemetry access is disabled")]
    Disabled,

    #[error("native telemetry access is closed")]
    Closed,
}

impl Error {
    /// Errors raised by the access arbitration layer rather than by the
    /// provider. These abort the operation in progress and go back to the
    /// caller untouched.
    pub fn is_arbitration(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted { .. }
                | Error::LockTimeout { .. }
                | Error::HandleUnavailable { .. }
                | Error::Disabled
                | Error::Closed
        )
    }

    pub(crate) fn from_io(err: io::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { context },
            io::ErrorKind::Unsupported => Error::NotImplemented { operation: context },
            _ => Error::TransientFailure {
                context: format!("{context}: {err}"),
            },
        }
    }

    pub(crate) fn transient(context: impl Into<String>) -> Self {
        Error::TransientFailure {
            context: context.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let denied = Error::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "environ");
        assert!(matches!(denied, Error::PermissionDenied { .. }));

        let unsupported = Error::from_io(io::Error::from(io::ErrorKind::Unsupported), "cpu");
        assert_eq!(
            unsupported,
            Error::NotImplemented {
                operation: "cpu".to_string()
            }
        );

        let gone = Error::from_io(io::Error::from(io::ErrorKind::NotFound), "stat");
        assert!(matches!(gone, Error::TransientFailure { .. }));
    }

    #[test]
    fn test_arbitration_errors() {
        assert!(Error::Disabled.is_arbitration());
        assert!(Error::Closed.is_arbitration());
        assert!(Error::ResourceExhausted { limit: 3 }.is_arbitration());
        assert!(
            Error::LockTimeout {
                resource: "snapshot refresh",
                timeout: Duration::from_secs(5),
            }
            .is_arbitration()
        );
        assert!(
            Error::HandleUnavailable {
                context: "no /proc".to_string()
            }
            .is_arbitration()
        );
        assert!(!Error::transient("boom").is_arbitration());
        assert!(
            !Error::PermissionDenied {
                context: "creds".to_string()
            }
            .is_arbitration()
        );
    }
}
