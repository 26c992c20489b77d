// Harness error taxonomy
//
// Three categories matter to callers:
// - configuration errors are test bugs: fail fast, never retried
// - connection errors are retried a bounded number of times by the driver
// - everything else is a hard failure of the current run

use std::time::Duration;
use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {0:?} waiting for requested event")]
    Timeout(Duration),

    #[error("debug session disconnected")]
    Disconnected,

    #[error("failed to launch debuggee after {attempts} attempts: {reason}")]
    Launch { attempts: usize, reason: String },
}

impl HarnessError {
    /// Configuration errors indicate a broken test setup rather than a
    /// failure of the system under test.
    pub fn is_test_bug(&self) -> bool {
        matches!(self, HarnessError::Config(_))
    }
}
