//! Error types for OSD client operations

use thiserror::Error;

/// Errors that can occur while dispatching object requests
#[derive(Debug, Error)]
pub enum OSDClientError {
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation failure reported by the daemon, as a negative errno.
    #[error("osd error {code}")]
    Osd { code: i32 },

    #[error("no osd map available")]
    NoMap,

    #[error("osd {0} has no address in the current map")]
    NoAddress(i32),

    #[error("corrupt osd_op_reply: {0}")]
    CorruptReply(String),

    #[error("corrupt osd map: {0}")]
    CorruptMap(String),
}

/// Result type alias for OSD client operations
pub type Result<T> = std::result::Result<T, OSDClientError>;
