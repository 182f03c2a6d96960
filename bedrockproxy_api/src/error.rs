//! Stable, client-facing error codes (§7 of the design: validation errors
//! are surfaced as response-level errors, never as a daemon crash).

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingServerId,
    InvalidAddress,
    InvalidAction,
    DuplicateAddress,
    ServerNotFound,
    ExecutablePathMissing,
    InvalidExecutable,
    ProcessNotRunning,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingServerId => "MISSING_SERVER_ID",
            Self::InvalidAddress => "INVALID_ADDRESS",
            Self::InvalidAction => "INVALID_ACTION",
            Self::DuplicateAddress => "DUPLICATE_ADDRESS",
            Self::ServerNotFound => "SERVER_NOT_FOUND",
            Self::ExecutablePathMissing => "EXECUTABLE_PATH_MISSING",
            Self::InvalidExecutable => "INVALID_EXECUTABLE",
            Self::ProcessNotRunning => "PROCESS_NOT_RUNNING",
        }
    }

    /// Builds the `"CODE: detail"` string carried in response envelopes.
    pub fn with_detail(self, detail: impl Display) -> String {
        format!("{}: {}", self.as_str(), detail)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
