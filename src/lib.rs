//! # sses
//!
//! Privacy-preserving symptom/medication search over homomorphically
//! encrypted patient profiles.
//!
//! A client submits its age/gender profile encrypted under its own key,
//! together with plaintext medicine and side-effect ids. The server narrows
//! the candidates with an inverted index, then runs a homomorphic equality
//! test whose blinded output only reveals *which* candidates match. The
//! client decrypts, picks the zero slots and asks for those records only.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core types (mask encoding, patient records, queries, results)
//! - `ports`: The `FheEngine` trait
//! - `adapters`: BFV engine (fhe.rs), key registry, dataset store, log sanitizer
//! - `application`: Queues, postings merge, matching evaluator, Calc Worker/Manager
//! - `protocol` / `server` / `client`: wire format, connection state machine, client driver

pub mod adapters;
pub mod application;
pub mod client;
pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
pub mod protocol;
pub mod server;

pub use adapters::StorageError;
pub use config::{ConfigError, ServerConfig};
pub use domain::CryptoError;

/// Result type for sses operations
pub type Result<T> = std::result::Result<T, SsesError>;

/// Main error type for sses
#[derive(Debug, thiserror::Error)]
pub enum SsesError {
    /// Request not valid in the connection's current state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A queue is full; nothing was enqueued.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A Calc Worker stopped, or shared state was poisoned by a panic.
    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage operation failed: {0}")]
    Storage(StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<StorageError> for SsesError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => SsesError::NotFound(what),
            other => SsesError::Storage(other),
        }
    }
}

impl From<domain::MaskError> for SsesError {
    fn from(err: domain::MaskError) -> Self {
        SsesError::InvalidParameter(err.to_string())
    }
}
