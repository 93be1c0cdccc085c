//! Cryptographic types shared by the client and the server.
//!
//! The concrete homomorphic-encryption library stays behind
//! [`FheEngine`](crate::ports::FheEngine); this module only carries the
//! library-independent pieces: errors, scheme settings and serialized
//! ciphertext containers.

use serde::{Deserialize, Serialize};

/// Error type for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("FHE computation failed: {0}")]
    Computation(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid scheme parameters: {0}")]
    InvalidParameters(String),
}

/// Scheme parameters used when generating a fresh key triple.
///
/// Loaded from a small JSON file (`settings/context.json` by default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Ring degree; also the number of plaintext slots.
    pub degree: usize,
    /// Plaintext modulus. Must be prime and congruent to 1 mod 2*degree for slot packing.
    pub plaintext_modulus: u64,
    /// Bit sizes of the ciphertext moduli chain.
    pub moduli_sizes: Vec<usize>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            degree: 8192,
            plaintext_modulus: 65537,
            moduli_sizes: vec![62, 62, 62, 62, 62],
        }
    }
}

impl ContextSettings {
    /// Load settings from a JSON file.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidParameters` if the file is unreadable or malformed.
    pub fn load(path: &std::path::Path) -> Result<Self, CryptoError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CryptoError::InvalidParameters(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: Self = serde_json::from_str(&content)
            .map_err(|e| CryptoError::InvalidParameters(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the structural constraints slot packing relies on.
    ///
    /// Primality of the plaintext modulus is left to the engine.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidParameters` describing the first violation.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if !self.degree.is_power_of_two() || self.degree < 1024 {
            return Err(CryptoError::InvalidParameters(format!(
                "degree must be a power of two >= 1024, got {}",
                self.degree
            )));
        }
        if self.plaintext_modulus % (2 * self.degree as u64) != 1 {
            return Err(CryptoError::InvalidParameters(format!(
                "plaintext modulus {} is not 1 mod {}",
                self.plaintext_modulus,
                2 * self.degree
            )));
        }
        if self.moduli_sizes.is_empty() {
            return Err(CryptoError::InvalidParameters(
                "at least one ciphertext modulus is required".into(),
            ));
        }
        Ok(())
    }
}

/// The three per-key files the Key Registry manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    PublicKey,
    SecretKey,
    Context,
}

impl KeyKind {
    pub const ALL: [KeyKind; 3] = [KeyKind::PublicKey, KeyKind::SecretKey, KeyKind::Context];

    /// File name prefix used on disk.
    #[must_use]
    pub fn file_prefix(self) -> &'static str {
        match self {
            KeyKind::PublicKey => "pk",
            KeyKind::SecretKey => "sk",
            KeyKind::Context => "ctxt",
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyKind::PublicKey => "public key",
            KeyKind::SecretKey => "secret key",
            KeyKind::Context => "context",
        };
        f.write_str(name)
    }
}

/// A batch of serialized ciphertexts, as carried by queries and results.
///
/// The bytes are opaque outside the engine that produced them.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextBuffer {
    ciphertexts: Vec<Vec<u8>>,
}

impl CiphertextBuffer {
    #[must_use]
    pub fn new(ciphertexts: Vec<Vec<u8>>) -> Self {
        Self { ciphertexts }
    }

    #[must_use]
    pub fn single(ciphertext: Vec<u8>) -> Self {
        Self {
            ciphertexts: vec![ciphertext],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ciphertexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ciphertexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.ciphertexts.iter().map(Vec::as_slice)
    }

    #[must_use]
    pub fn first(&self) -> Option<&[u8]> {
        self.ciphertexts.first().map(Vec::as_slice)
    }

    /// Total serialized size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.ciphertexts.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<Vec<u8>> {
        self.ciphertexts
    }
}

// Ciphertext bytes are large and meaningless in logs.
impl std::fmt::Debug for CiphertextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextBuffer")
            .field("count", &self.ciphertexts.len())
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Short SHA-256 fingerprint used to identify key material in logs.
#[must_use]
pub fn fingerprint(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(bytes);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
