//! Source table ingestion.
//!
//! The table is a CSV with a header row. Each row names one
//! (patient, medicine, side effect) observation; rows sharing a patient id
//! are folded into one [`PatientRecord`]. Age and gender are taken from the
//! first row seen for a patient.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::StorageError;
use crate::domain::{Gender, PatientId, PatientRecord};

const ID_COLUMN: usize = 0;
const MEDICINE_COLUMN: usize = 1;
const SIDE_EFFECT_COLUMN: usize = 2;
const AGE_COLUMN: usize = 8;
const GENDER_COLUMN: usize = 9;

/// Aggregated contents of a source table.
#[derive(Debug, Default)]
pub struct SourceTable {
    pub records: BTreeMap<PatientId, PatientRecord>,
    pub medicines: BTreeSet<u32>,
    pub side_effects: BTreeSet<u32>,
}

impl SourceTable {
    /// Read and aggregate a source table.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the file is missing, and
    /// `StorageError::Malformed` naming the line of the first bad row.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Err(StorageError::NotFound(format!(
                "source table {}",
                path.display()
            )));
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut table = Self::default();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            // +2: one for the header, one for 1-based numbering.
            table
                .ingest(&record)
                .map_err(|reason| StorageError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("line {}: {reason}", row + 2),
                })?;
        }
        Ok(table)
    }

    fn ingest(&mut self, row: &csv::StringRecord) -> Result<(), String> {
        let id: PatientId = field(row, ID_COLUMN, "record id")?;
        let medicine: u32 = field(row, MEDICINE_COLUMN, "medicine id")?;
        let side_effect: u32 = field(row, SIDE_EFFECT_COLUMN, "side effect id")?;

        self.medicines.insert(medicine);
        self.side_effects.insert(side_effect);

        let record = match self.records.entry(id) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let age: i64 = field(row, AGE_COLUMN, "age")?;
                let code: u8 = field(row, GENDER_COLUMN, "gender")?;
                let gender = Gender::from_table_code(code)
                    .ok_or_else(|| format!("gender code {code} is not 1, 2 or 3"))?;
                entry.insert(PatientRecord::new(id, age, gender).map_err(|e| e.to_string())?)
            }
        };
        record.medicines.insert(medicine);
        record.side_effects.insert(side_effect);
        Ok(())
    }
}

fn field<T>(row: &csv::StringRecord, column: usize, what: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = row
        .get(column)
        .ok_or_else(|| format!("missing {what} (column {column})"))?;
    raw.parse()
        .map_err(|e| format!("bad {what} '{raw}': {e}"))
}
