//! Inverted index: attribute id to sorted postings list.
//!
//! On-disk format (`med.inv` / `side.inv`):
//!
//! ```text
//! <number of ids>
//! <id>:<postings count>
//! <patient id>
//! ...
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use super::{read_text, write_atomic, StorageError};
use crate::domain::PatientId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvertedIndex {
    postings: BTreeMap<u32, Vec<PatientId>>,
}

impl InvertedIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an id with an empty postings list.
    pub fn declare(&mut self, id: u32) {
        self.postings.entry(id).or_default();
    }

    /// Add `patient` to the postings of `id`, keeping the list strictly increasing.
    pub fn insert(&mut self, id: u32, patient: PatientId) {
        let list = self.postings.entry(id).or_default();
        if let Err(pos) = list.binary_search(&patient) {
            list.insert(pos, patient);
        }
    }

    /// Postings for `id`; unknown ids have none.
    #[must_use]
    pub fn get(&self, id: u32) -> &[PatientId] {
        self.postings.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Postings lists for several ids, in the order given.
    #[must_use]
    pub fn lists<'a>(&'a self, ids: &[u32]) -> Vec<&'a [PatientId]> {
        ids.iter().map(|&id| self.get(id)).collect()
    }

    /// Number of distinct ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.postings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n", self.postings.len());
        for (id, list) in &self.postings {
            out.push_str(&format!("{id}:{}\n", list.len()));
            for patient in list {
                out.push_str(&format!("{patient}\n"));
            }
        }
        out
    }

    /// Parse the text format. Postings are re-sorted and deduplicated.
    ///
    /// # Errors
    /// Returns a description of the first malformed token.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut tokens = text.split_whitespace();
        let count: usize = next_number(&mut tokens, "id count")?;

        let mut index = Self::new();
        for _ in 0..count {
            let header = tokens.next().ok_or("truncated index header")?;
            let (id, n) = header
                .split_once(':')
                .ok_or_else(|| format!("expected '<id>:<count>', got '{header}'"))?;
            let id: u32 = id.parse().map_err(|e| format!("bad id '{id}': {e}"))?;
            let n: usize = n.parse().map_err(|e| format!("bad count '{n}': {e}"))?;

            index.declare(id);
            for _ in 0..n {
                let patient = next_number(&mut tokens, "patient id")?;
                index.insert(id, patient);
            }
        }
        Ok(index)
    }

    /// # Errors
    /// Returns `StorageError` on I/O failure or a malformed file.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let text = read_text(path)?;
        Self::parse(&text).map_err(|reason| StorageError::Malformed {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// # Errors
    /// Returns `StorageError::Io` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        write_atomic(path, self.to_text().as_bytes())
    }
}

fn next_number<'a, T, I>(tokens: &mut I, what: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    I: Iterator<Item = &'a str>,
{
    let token = tokens.next().ok_or_else(|| format!("missing {what}"))?;
    token
        .parse()
        .map_err(|e| format!("bad {what} '{token}': {e}"))
}
