//! Unified error types for Threatgate

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BouncerError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache storage error: {0}")]
    Storage(String),

    #[error("LAPI returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("LAPI did not respond within {0:?}")]
    Timeout(std::time::Duration),

    #[error("LAPI transport error: {0}")]
    Transport(String),

    #[error("Stream warm-up failed: {0}")]
    WarmUp(String),

    #[error("Stream synchronisation already in progress")]
    Busy,

    #[error("Persisted cache format mismatch: {0}")]
    CacheVersion(String),

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Upstream connection failed: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, BouncerError>;
