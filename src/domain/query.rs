//! Query and result model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::CiphertextBuffer;
use super::mask::Gender;
use super::patient::PatientId;

/// Namespace selecting a key triple and its dataset.
pub type KeyId = u64;

/// Identifier handed out by the Calc Manager for an admitted query.
pub type QueryId = i64;

/// Separator used for the medicine and side-effect id lists.
pub const ID_LIST_DELIMITER: char = ':';

/// Parameters of a search.
///
/// Age and gender are only known to the client; a server-side query carries
/// them encrypted in [`Query::enc_mask`] and leaves these fields empty.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationParam {
    pub age: Option<u8>,
    pub gender: Option<Gender>,
    /// `:`-delimited medicine ids.
    pub medicines: String,
    /// `:`-delimited side-effect ids.
    pub side_effects: String,
}

// Age and gender are the protected attributes; keep them out of logs.
impl std::fmt::Debug for ComputationParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationParam")
            .field("age", &self.age.map(|_| "<redacted>"))
            .field("gender", &self.gender.map(|_| "<redacted>"))
            .field("medicines", &self.medicines)
            .field("side_effects", &self.side_effects)
            .finish()
    }
}

impl ComputationParam {
    /// Parameters as sent to the server: id lists only.
    #[must_use]
    pub fn for_server(medicines: &[u32], side_effects: &[u32]) -> Self {
        Self {
            age: None,
            gender: None,
            medicines: join_ids(medicines),
            side_effects: join_ids(side_effects),
        }
    }

    /// Parsed medicine ids.
    ///
    /// # Errors
    /// Returns the offending token if it is not an unsigned integer.
    pub fn medicine_ids(&self) -> Result<Vec<u32>, String> {
        parse_ids(&self.medicines)
    }

    /// Parsed side-effect ids.
    ///
    /// # Errors
    /// Returns the offending token if it is not an unsigned integer.
    pub fn side_effect_ids(&self) -> Result<Vec<u32>, String> {
        parse_ids(&self.side_effects)
    }
}

/// Render ids with the list delimiter.
#[must_use]
pub fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(&ID_LIST_DELIMITER.to_string())
}

/// Parse a delimited id list. Empty tokens are skipped.
///
/// # Errors
/// Returns the offending token if it is not an unsigned integer.
pub fn parse_ids(list: &str) -> Result<Vec<u32>, String> {
    list.split(ID_LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|_| s.to_string()))
        .collect()
}

/// A search request waiting for a Calc Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub key_id: KeyId,
    pub param: ComputationParam,
    /// Negated query mask, encrypted into every slot.
    pub enc_mask: CiphertextBuffer,
}

/// Output of one processed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub key_id: KeyId,
    pub query_id: QueryId,
    pub success: bool,
    /// One blinded ciphertext per chunk.
    pub chunk_results: CiphertextBuffer,
    /// Candidate ids behind each chunk, slot by slot.
    pub chunks: Vec<Vec<PatientId>>,
    pub created_at: DateTime<Utc>,
}

impl QueryResult {
    #[must_use]
    pub fn new(
        key_id: KeyId,
        query_id: QueryId,
        chunk_results: CiphertextBuffer,
        chunks: Vec<Vec<PatientId>>,
    ) -> Self {
        Self {
            key_id,
            query_id,
            success: true,
            chunk_results,
            chunks,
            created_at: Utc::now(),
        }
    }

    /// A result for a query the worker could not process.
    #[must_use]
    pub fn failed(key_id: KeyId, query_id: QueryId) -> Self {
        Self {
            success: false,
            ..Self::new(key_id, query_id, CiphertextBuffer::default(), Vec::new())
        }
    }

    #[must_use]
    pub fn status(&self) -> ResultStatus {
        self.success.into()
    }

    /// Seconds elapsed since the result was produced.
    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    /// Map a client selection back to a patient id.
    ///
    /// Selections outside the stored chunk map yield `None`; padding slots
    /// past the end of a chunk can decrypt to zero as well.
    #[must_use]
    pub fn resolve(&self, selection: SelectedPosition) -> Option<PatientId> {
        self.chunks
            .get(selection.chunk)
            .and_then(|chunk| chunk.get(selection.position))
            .copied()
    }
}

/// A (chunk, slot) pair the client decrypted to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SelectedPosition {
    pub chunk: usize,
    pub position: usize,
}

/// Status reported alongside chunk results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    Failed,
}

impl From<bool> for ResultStatus {
    fn from(success: bool) -> Self {
        if success {
            ResultStatus::Success
        } else {
            ResultStatus::Failed
        }
    }
}
