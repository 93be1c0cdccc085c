//! Patient profiles as ingested from the source table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::mask::{compute_mask, Gender, MaskError};

/// Patient identifier (record id column of the source table).
pub type PatientId = u32;

/// Aggregated profile of one patient.
///
/// Only lives while a dataset is being built; it is flattened into the index,
/// ciphertext and aux files and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    pub id: PatientId,
    pub mask: i64,
    pub medicines: BTreeSet<u32>,
    pub side_effects: BTreeSet<u32>,
}

impl PatientRecord {
    /// Start a record from the first source row seen for a patient.
    ///
    /// # Errors
    /// Returns `MaskError` if the age is outside the encodable range.
    pub fn new(id: PatientId, age: i64, gender: Gender) -> Result<Self, MaskError> {
        Ok(Self {
            id,
            mask: compute_mask(age, gender)?,
            medicines: BTreeSet::new(),
            side_effects: BTreeSet::new(),
        })
    }

    /// Plaintext half of the record, as written to its aux file.
    #[must_use]
    pub fn aux(&self) -> AuxRecord {
        AuxRecord {
            medicines: self.medicines.iter().copied().collect(),
            side_effects: self.side_effects.iter().copied().collect(),
        }
    }
}

/// Medicine and side-effect ids of one patient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxRecord {
    pub medicines: Vec<u32>,
    pub side_effects: Vec<u32>,
}

const MEDICINE_LABEL: &str = "Medicine:";
const SIDE_EFFECT_LABEL: &str = "Side Effect:";

impl AuxRecord {
    /// Render the two-line bracketed text format.
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "{MEDICINE_LABEL} {}\n{SIDE_EFFECT_LABEL} {}\n",
            bracketed(&self.medicines),
            bracketed(&self.side_effects)
        )
    }

    /// Parse the format produced by [`AuxRecord::to_text`].
    ///
    /// # Errors
    /// Returns a description of the first malformed line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let medicines = parse_line(lines.next(), MEDICINE_LABEL)?;
        let side_effects = parse_line(lines.next(), SIDE_EFFECT_LABEL)?;
        Ok(Self {
            medicines,
            side_effects,
        })
    }
}

fn bracketed(ids: &[u32]) -> String {
    let joined = ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

fn parse_line(line: Option<&str>, label: &str) -> Result<Vec<u32>, String> {
    let line = line.ok_or_else(|| format!("missing '{label}' line"))?;
    let rest = line
        .trim()
        .strip_prefix(label)
        .ok_or_else(|| format!("expected '{label}', got '{line}'"))?;
    let inner = rest
        .trim()
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(|| format!("'{label}' list is not bracketed"))?;

    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|e| format!("bad id '{s}': {e}")))
        .collect()
}

/// A record handed back to the client after it selected the matching slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisclosedRecord {
    pub id: PatientId,
    pub medicines: Vec<u32>,
    pub side_effects: Vec<u32>,
}

impl DisclosedRecord {
    #[must_use]
    pub fn new(id: PatientId, aux: AuxRecord) -> Self {
        Self {
            id,
            medicines: aux.medicines,
            side_effects: aux.side_effects,
        }
    }
}
