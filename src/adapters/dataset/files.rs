//! Small text files describing datasets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{read_text, write_atomic, StorageError};
use crate::domain::KeyId;

/// Contents of `dbbasics.bin`: status flag and counts, one per line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbBasics {
    pub active: bool,
    pub records: usize,
    pub medicines: usize,
    pub side_effects: usize,
}

impl DbBasics {
    #[must_use]
    pub fn active(records: usize, medicines: usize, side_effects: usize) -> Self {
        Self {
            active: true,
            records,
            medicines,
            side_effects,
        }
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n",
            u8::from(self.active),
            self.records,
            self.medicines,
            self.side_effects
        )
    }

    /// # Errors
    /// Returns a description of the first malformed line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut fields = text.split_whitespace();
        let mut next = |what: &str| -> Result<usize, String> {
            let token = fields.next().ok_or_else(|| format!("missing {what}"))?;
            token
                .parse::<usize>()
                .map_err(|e| format!("bad {what} '{token}': {e}"))
        };
        Ok(Self {
            active: next("status")? == 1,
            records: next("record count")?,
            medicines: next("medicine count")?,
            side_effects: next("side effect count")?,
        })
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

impl std::fmt::Display for DbBasics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "records={}, medicines={}, side_effects={}",
            self.records, self.medicines, self.side_effects
        )
    }
}

/// `list.txt`: key-id to dataset directory, so datasets survive restarts.
///
/// ```text
/// <number of entries>
/// <key id>,<directory>
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFile {
    pub entries: BTreeMap<KeyId, PathBuf>,
}

impl ListFile {
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n", self.entries.len());
        for (key_id, dir) in &self.entries {
            out.push_str(&format!("{key_id},{}\n", dir.display()));
        }
        out
    }

    /// # Errors
    /// Returns a description of the first malformed line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let count: usize = match lines.next() {
            Some(first) => first
                .parse()
                .map_err(|e| format!("bad entry count '{first}': {e}"))?,
            None => return Ok(Self::default()),
        };

        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let line = lines.next().ok_or("truncated list file")?;
            let (key_id, dir) = line
                .split_once(',')
                .ok_or_else(|| format!("expected '<key id>,<dir>', got '{line}'"))?;
            let key_id: KeyId = key_id
                .trim()
                .parse()
                .map_err(|e| format!("bad key id '{key_id}': {e}"))?;
            entries.insert(key_id, PathBuf::from(dir.trim()));
        }
        Ok(Self { entries })
    }

    /// Load the list, treating a missing file as empty.
    ///
    /// # Errors
    /// Returns `StorageError` on I/O failure or a malformed file.
    pub fn load_or_default(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Ok(Self::default());
        }
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
