//! Domain layer: Core types shared by client and server.
//!
//! Pure Rust types with no I/O beyond loading small settings files.

mod crypto;
pub mod mask;
mod patient;
mod query;

pub use crypto::{fingerprint, CiphertextBuffer, ContextSettings, CryptoError, KeyKind};
pub use mask::{compute_mask, Gender, MaskError};
pub use patient::{AuxRecord, DisclosedRecord, PatientId, PatientRecord};
pub use query::{
    join_ids, parse_ids, ComputationParam, KeyId, Query, QueryId, QueryResult, ResultStatus,
    SelectedPosition,
};
