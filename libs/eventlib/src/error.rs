//! Error types for eventlib
//!
//! Defines the core error types used throughout the event-building path.
//! The error kinds mirror the recovery policy: configuration and transport
//! errors are survivable and reported to the caller, protocol and capacity
//! errors indicate upstream corruption or broken flow control and are fatal
//! to the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EbError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Transport failure on link to peer {peer}: rc {rc}")]
    Transport { peer: usize, rc: i32 },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Shared memory operation failed: {0}")]
    Shmem(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type that uses EbError
pub type Result<T> = std::result::Result<T, EbError>;
