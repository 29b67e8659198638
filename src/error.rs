//! Error types for matmul-validator operations.
//!
//! Every failure in the pipeline is unrecoverable within a single run: there is
//! no retry logic anywhere. Callers either complete the one attempt or abort.

use std::io;
use thiserror::Error;

use crate::accel::SessionState;
use crate::Element;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating an accelerator kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed command-line arguments.
    #[error("Usage: {program} <accelerator_binary_path>")]
    Usage {
        /// Program name as invoked.
        program: String,
    },

    /// Host or device memory could not be allocated.
    #[error("allocation failed for {what}: {message}")]
    Allocation {
        /// Which buffer was being allocated.
        what: String,
        /// Diagnostic from the allocator or runtime.
        message: String,
    },

    /// No compatible device, program load failure, or kernel resolution failure.
    #[error("accelerator initialization failed: {0}")]
    Initialization(String),

    /// Kernel argument binding or enqueue was rejected.
    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),

    /// A session operation was invoked out of order.
    #[error("{operation} requires session state {expected}, but session is {actual:?}")]
    Sequence {
        /// The operation that was attempted.
        operation: &'static str,
        /// Human-readable description of the accepted state(s).
        expected: &'static str,
        /// The state the session was actually in.
        actual: SessionState,
    },

    /// Verification found a discrepancy between reference and accelerator output.
    #[error("Mismatch at ({row}, {col}): {actual} (should be {expected}).")]
    Mismatch {
        /// Row of the first offending element.
        row: usize,
        /// Column of the first offending element.
        col: usize,
        /// Reference value.
        expected: Element,
        /// Accelerator value.
        actual: Element,
    },

    /// A host slice and a device buffer disagree in element count.
    #[error("buffer size mismatch for {what}: expected {expected} elements, got {actual}")]
    BufferSize {
        /// Which buffer was checked.
        what: &'static str,
        /// Element count derived from the matrix dimensions or allocation.
        expected: usize,
        /// Element count actually supplied.
        actual: usize,
    },

    /// A blocking transfer between host and device failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Configuration file could not be parsed.
    #[error("configuration error at line {line}: {message}")]
    ConfigParse {
        /// Line number where the error occurred (1-indexed).
        line: usize,
        /// Error message describing the issue.
        message: String,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    /// Invalid configuration value.
    #[error("invalid configuration value for '{key}': {message}")]
    ConfigInvalid {
        /// The configuration key with invalid value.
        key: String,
        /// Error message describing why the value is invalid.
        message: String,
    },

    /// I/O error (reading the program binary, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// Usage errors exit with `-1`, verification mismatches with `1`, and every
    /// infrastructure failure with `2`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } => -1,
            Self::Mismatch { .. } => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_names_program() {
        let err = Error::Usage {
            program: "matmul-validator".to_string(),
        };
        assert_eq!(err.to_string(), "Usage: matmul-validator <accelerator_binary_path>");
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn test_mismatch_display_matches_report_format() {
        let err = Error::Mismatch {
            row: 1,
            col: 1,
            expected: 50.0,
            actual: 50.01,
        };
        assert_eq!(err.to_string(), "Mismatch at (1, 1): 50.01 (should be 50).");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_sequence_error_includes_state() {
        let err = Error::Sequence {
            operation: "bind_and_dispatch",
            expected: "DataUploaded",
            actual: SessionState::Opened,
        };
        let display = err.to_string();
        assert!(display.contains("bind_and_dispatch"), "{display}");
        assert!(display.contains("Opened"), "{display}");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_buffer_size_includes_counts() {
        let err = Error::BufferSize {
            what: "A",
            expected: 16,
            actual: 12,
        };
        let display = err.to_string();
        assert!(display.contains("16"));
        assert!(display.contains("12"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "kernel.aocx");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("kernel.aocx"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
