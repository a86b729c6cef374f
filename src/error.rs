//! Custom error types for the master board.
//!
//! This module defines `MasterError`, the single error type used across the crate.
//! It separates two kinds of failure that the rest of the code treats very
//! differently:
//!
//! ## Contract violations (always fatal, never retried)
//!
//! - **`ProtocolMismatch`**: a response frame did not echo the module and sub-command
//!   codes of the request that produced it. This points at a codec bug or a misrouted
//!   reply, not at a flaky device.
//! - **`TruncatedFrame`**: the decoder was asked for more bytes than the frame holds.
//! - **`NoResponse`**: the transport exhausted its resend budget without an answer.
//!   Drivers surface this directly; resending is the transport's job alone.
//! - **`EchoMismatch`**: an identifier echoed in a reply (dispenser id, fan id, ...)
//!   differs from the one that was sent.
//!
//! ## Authoring and setup errors
//!
//! - **`Recipe`**: an unknown module tag, unknown operation, or wrong argument count in
//!   a command descriptor. Raised when a recipe is constructed, before anything is sent.
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures respectively.
//! - **`Io`** / **`Serial`**: failures of the underlying link.
//!
//! Runtime device outcomes (a motor fault, a move that never finished) are *not*
//! errors. They travel as [`crate::modules::ReturnCode`] values so the sequencer
//! can short-circuit uniformly.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, MasterError>;

/// Every failure the crate reports as `Err`.
#[derive(Error, Debug)]
pub enum MasterError {
    /// A reply carried other module/sub codes than its request.
    #[error(
        "Protocol mismatch: expected code pair {:#04x}/{:#04x}, found {:#04x}/{:#04x}",
        expected.0, expected.1, found.0, found.1
    )]
    ProtocolMismatch {
        /// Codes of the request.
        expected: (u8, u8),
        /// Codes found in the reply.
        found: (u8, u8),
    },

    /// The decoder ran past the end of a frame.
    #[error("Truncated frame: needed {needed} byte(s), {remaining} remaining")]
    TruncatedFrame {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the frame.
        remaining: usize,
    },

    /// Every attempt of an exchange went unanswered.
    #[error("No response from module {module:#04x} (sub-command {sub:#04x})")]
    NoResponse {
        /// Request code of the silent module.
        module: u8,
        /// Sub-command that was sent.
        sub: u8,
    },

    /// A reply echoed a different identifier than the request.
    #[error("Echo mismatch from module {module:#04x}: {field} expected {expected}, found {found}")]
    EchoMismatch {
        /// Request code of the replying module.
        module: u8,
        /// Name of the echoed field.
        field: &'static str,
        /// Value that was sent.
        expected: u8,
        /// Value that came back.
        found: u8,
    },

    /// A command descriptor could not be turned into a step.
    #[error("Invalid recipe: {0}")]
    Recipe(String),

    /// Figment could not extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or link I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or driven.
    #[error("Serial link error: {0}")]
    #[cfg(feature = "serial")]
    Serial(String),

    /// A stage worker's task is gone.
    #[error("Background worker has stopped")]
    WorkerStopped,
}

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for MasterError {
    fn from(err: tokio_serial::Error) -> Self {
        MasterError::Serial(err.to_string())
    }
}

impl MasterError {
    /// True for errors raised by a malformed recipe or configuration rather than by
    /// the link or the slave board.
    pub fn is_authoring_error(&self) -> bool {
        matches!(
            self,
            MasterError::Recipe(_) | MasterError::Config(_) | MasterError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_mismatch_display() {
        let err = MasterError::ProtocolMismatch {
            expected: (0x21, 0x05),
            found: (0x22, 0x00),
        };
        assert_eq!(
            err.to_string(),
            "Protocol mismatch: expected code pair 0x21/0x05, found 0x22/0x00"
        );
    }

    #[test]
    fn test_no_response_display() {
        let err = MasterError::NoResponse {
            module: 0x24,
            sub: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "No response from module 0x24 (sub-command 0x02)"
        );
    }

    #[test]
    fn test_echo_mismatch_display() {
        let err = MasterError::EchoMismatch {
            module: 0x21,
            field: "dispenser id",
            expected: 0,
            found: 2,
        };
        assert!(err.to_string().contains("dispenser id expected 0, found 2"));
    }

    #[test]
    fn test_authoring_errors() {
        assert!(MasterError::Recipe("empty cmd".into()).is_authoring_error());
        assert!(MasterError::Configuration("bad".into()).is_authoring_error());
        assert!(!MasterError::WorkerStopped.is_authoring_error());
        assert!(!MasterError::TruncatedFrame {
            needed: 4,
            remaining: 1
        }
        .is_authoring_error());
    }
}
