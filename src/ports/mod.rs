//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, the homomorphic-encryption library sits
//! behind [`FheEngine`] so the matching pipeline never names it directly.

mod fhe_engine;

pub use fhe_engine::FheEngine;
