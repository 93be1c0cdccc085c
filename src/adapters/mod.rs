//! Adapters layer: Concrete implementations of ports and storage.
//!
//! - `bfv`: fhe.rs BFV engine
//! - `keystore`: file-backed Key Registry
//! - `dataset`: per key-id Dataset Store
//! - `sanitize`: PII filtering for logs

pub mod bfv;
pub mod dataset;
pub mod keystore;
pub mod sanitize;

pub use dataset::StorageError;
