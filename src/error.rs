// Caller-facing error taxonomy.

use thiserror::Error;

/// Outcomes exposed to the surrounding process.
///
/// `Closed` and `Timeout` leave the last checkpoint valid so a later call
/// can resume the download; `Fault` tears the engine down and erases the
/// checkpoint.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("invalid argument: {0}")]
    BadParameter(&'static str),
    #[error("update resource is held elsewhere")]
    Busy,
    #[error("input stream closed at byte {0} before the full package")]
    Closed(u64),
    #[error("no input for {0} seconds")]
    Timeout(u64),
    #[error("staging partition unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Fault(String),
}

impl UpdateError {
    /// Short tag for log records.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::BadParameter(_) => "bad-parameter",
            UpdateError::Busy => "busy",
            UpdateError::Closed(_) => "closed",
            UpdateError::Timeout(_) => "timeout",
            UpdateError::Unavailable(_) => "unavailable",
            UpdateError::Fault(_) => "fault",
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
