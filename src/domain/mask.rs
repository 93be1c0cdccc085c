//! Age/gender mask encoding.
//!
//! A patient's age and gender are folded into one small integer so that the
//! server can compare a client's encrypted profile against every candidate
//! with a single homomorphic subtraction. Genders occupy disjoint blocks of
//! 128 values, ages index into the block, and the whole range is shifted by
//! the width of the matching window so it never goes negative.

use serde::{Deserialize, Serialize};

/// Half-width of the equality window used by the range-zero test.
pub const MATCH_WINDOW: i64 = 5;

/// Oldest age the encoding accepts.
pub const MAX_AGE: u8 = 122;

/// Width of one gender block.
const GENDER_STRIDE: i64 = 128;

/// Largest mask value the encoding can produce.
pub const MAX_MASK: i64 = MAX_AGE as i64 + 2 * GENDER_STRIDE + MATCH_WINDOW;

/// Gender as recorded in patient profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    /// Block index used in the mask.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Gender::Male => 0,
            Gender::Female => 1,
            Gender::Other => 2,
        }
    }

    /// Decode the numeric gender column of the source table (1, 2 or 3).
    #[must_use]
    pub fn from_table_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Gender::Male),
            2 => Some(Gender::Female),
            3 => Some(Gender::Other),
            _ => None,
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "male" => Ok(Gender::Male),
            "f" | "female" => Ok(Gender::Female),
            "o" | "other" => Ok(Gender::Other),
            other => Err(MaskError::UnknownGender(other.to_string())),
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = match self {
            Gender::Male => "m",
            Gender::Female => "f",
            Gender::Other => "o",
        };
        f.write_str(c)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaskError {
    #[error("age {0} out of range [0, {MAX_AGE}]")]
    AgeOutOfRange(i64),

    #[error("unknown gender '{0}' (expected m, f or o)")]
    UnknownGender(String),
}

/// Encode an (age, gender) pair.
///
/// # Errors
/// Returns `MaskError::AgeOutOfRange` for ages above [`MAX_AGE`].
pub fn compute_mask(age: i64, gender: Gender) -> Result<i64, MaskError> {
    if !(0..=i64::from(MAX_AGE)).contains(&age) {
        return Err(MaskError::AgeOutOfRange(age));
    }
    Ok(age + gender.code() * GENDER_STRIDE + MATCH_WINDOW)
}
