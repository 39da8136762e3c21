//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::connection::ConnectError;
use crate::core::executor::{ExecutionPhase, RunOutcome, SequenceError};
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;

    /// Peripheral has no writable characteristic
    pub const NOT_WRITABLE: u8 = 18;

    /// Sequence rejected before starting
    pub const NOTHING_TO_RUN: u8 = 19;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a summary line
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<ConnectError> for CliResult {
    fn from(err: ConnectError) -> Self {
        let code = match &err {
            ConnectError::NoEndpointSelected => ExitCodes::INVALID_ARGS,
            ConnectError::Transport(TransportError::OpenFailed(msg)) => {
                let msg = msg.to_lowercase();
                if msg.contains("permission") {
                    ExitCodes::PERMISSION_DENIED
                } else if msg.contains("busy") {
                    ExitCodes::DEVICE_BUSY
                } else if msg.contains("not found") {
                    ExitCodes::DEVICE_NOT_FOUND
                } else {
                    ExitCodes::CONNECTION_FAILED
                }
            }
            ConnectError::Transport(TransportError::ConnectFailed(msg))
                if msg.contains("not found") =>
            {
                ExitCodes::DEVICE_NOT_FOUND
            }
            ConnectError::Transport(TransportError::NoWritableCharacteristic) => {
                ExitCodes::NOT_WRITABLE
            }
            ConnectError::Transport(_) => ExitCodes::CONNECTION_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<SequenceError> for CliResult {
    fn from(err: SequenceError) -> Self {
        Self::Error(ExitCodes::NOTHING_TO_RUN, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<&RunOutcome> for CliResult {
    fn from(outcome: &RunOutcome) -> Self {
        let summary = format!(
            "{} steps, {} frames sent, {} dropped",
            outcome.steps_executed, outcome.frames_sent, outcome.frames_dropped
        );
        match outcome.phase {
            ExecutionPhase::Completed => Self::success_with_message(format!("Completed: {summary}")),
            ExecutionPhase::Cancelled => {
                Self::Error(ExitCodes::CANCELLED, format!("Cancelled: {summary}"))
            }
            _ => Self::Error(ExitCodes::INTERNAL_ERROR, format!("Run aborted: {summary}")),
        }
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        7 => "Permission denied",
        8 => "Configuration error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device busy",
        18 => "No writable characteristic",
        19 => "Nothing to run",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 7, 8, 11, 12, 13, 18, 19, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_connect_error_codes() {
        let busy = ConnectError::Transport(TransportError::OpenFailed("COM5: device not found or busy".into()));
        assert_eq!(CliResult::from(busy).code(), ExitCodes::DEVICE_BUSY);

        let denied = ConnectError::Transport(TransportError::OpenFailed("/dev/rfcomm0: permission denied".into()));
        assert_eq!(CliResult::from(denied).code(), ExitCodes::PERMISSION_DENIED);

        let missing = ConnectError::Transport(TransportError::ConnectFailed("Device 'AA' not found".into()));
        assert_eq!(CliResult::from(missing).code(), ExitCodes::DEVICE_NOT_FOUND);

        let timeout = ConnectError::Transport(TransportError::ConnectFailed("Connection timeout after 10s".into()));
        assert_eq!(CliResult::from(timeout).code(), ExitCodes::CONNECTION_FAILED);

        assert_eq!(CliResult::from(ConnectError::NoEndpointSelected).code(), ExitCodes::INVALID_ARGS);
    }

    #[test]
    fn test_outcome_codes() {
        let mut outcome = RunOutcome {
            run_id: uuid::Uuid::nil(),
            phase: ExecutionPhase::Completed,
            steps_executed: 3,
            frames_sent: 3,
            frames_dropped: 0,
        };
        assert!(CliResult::from(&outcome).is_success());

        outcome.phase = ExecutionPhase::Cancelled;
        let result = CliResult::from(&outcome);
        assert_eq!(result.code(), ExitCodes::CANCELLED);
        assert_eq!(result.message(), Some("Cancelled: 3 steps, 3 frames sent, 0 dropped"));

        assert_eq!(CliResult::from(SequenceError::Empty).code(), ExitCodes::NOTHING_TO_RUN);
    }
}
