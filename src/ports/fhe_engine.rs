//! FHE Engine port: Trait for homomorphic encryption over packed slots.
//!
//! The matching pipeline and the client only speak to this trait; the
//! concrete scheme (BFV via `fhe`) lives in `adapters::bfv`.

use zeroize::Zeroizing;

use crate::domain::{ContextSettings, CryptoError};

/// Trait for slot-packed FHE operations.
///
/// Integers crossing this boundary are signed; implementations reduce them
/// modulo the plaintext modulus on the way in and center them on the way out.
pub trait FheEngine: Send + Sync {
    /// Scheme parameters shared by every key of one key-id.
    type Context: Clone + Send + Sync;
    /// Public material the server computes with.
    type PublicKey: Send + Sync;
    /// Decryption key. Never leaves the client.
    type SecretKey: Send + Sync;
    type Ciphertext: Clone + Send + Sync;
    type Plaintext: Send + Sync;

    /// Build a context from scheme settings.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidParameters` if the settings are rejected.
    fn create_context(&self, settings: &ContextSettings) -> Result<Self::Context, CryptoError>;

    /// Generate a fresh key pair with a CSPRNG.
    ///
    /// # Errors
    /// Returns `CryptoError::KeyGeneration` if key generation fails.
    fn generate_keys(
        &self,
        ctx: &Self::Context,
    ) -> Result<(Self::PublicKey, Self::SecretKey), CryptoError>;

    /// Number of plaintext slots per ciphertext.
    fn slot_count(&self, ctx: &Self::Context) -> usize;

    /// Encode values slot by slot; missing trailing slots are zero.
    ///
    /// # Errors
    /// Returns `CryptoError::Encryption` if more values than slots are given.
    fn encode_slots(&self, ctx: &Self::Context, values: &[i64])
        -> Result<Self::Plaintext, CryptoError>;

    /// Encrypt `value` into every slot.
    ///
    /// # Errors
    /// Returns `CryptoError::Encryption` if encryption fails.
    fn encrypt(
        &self,
        ctx: &Self::Context,
        pk: &Self::PublicKey,
        value: i64,
    ) -> Result<Self::Ciphertext, CryptoError> {
        let values = vec![value; self.slot_count(ctx)];
        self.encrypt_slots(ctx, pk, &values)
    }

    /// Encrypt one value per slot.
    ///
    /// # Errors
    /// Returns `CryptoError::Encryption` if encryption fails.
    fn encrypt_slots(
        &self,
        ctx: &Self::Context,
        pk: &Self::PublicKey,
        values: &[i64],
    ) -> Result<Self::Ciphertext, CryptoError>;

    /// Decrypt every slot.
    ///
    /// # Errors
    /// Returns `CryptoError::Decryption` if decryption fails.
    fn decrypt(
        &self,
        ctx: &Self::Context,
        sk: &Self::SecretKey,
        ct: &Self::Ciphertext,
    ) -> Result<Vec<i64>, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Computation` on mismatched operands.
    fn add(&self, a: &Self::Ciphertext, b: &Self::Ciphertext)
        -> Result<Self::Ciphertext, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Computation` on mismatched operands.
    fn add_plain(
        &self,
        a: &Self::Ciphertext,
        p: &Self::Plaintext,
    ) -> Result<Self::Ciphertext, CryptoError>;

    /// Ciphertext product, relinearized with the evaluation material in `pk`.
    ///
    /// # Errors
    /// Returns `CryptoError::Computation` on mismatched operands.
    fn multiply(
        &self,
        pk: &Self::PublicKey,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Computation` on mismatched operands.
    fn multiply_plain(
        &self,
        a: &Self::Ciphertext,
        p: &Self::Plaintext,
    ) -> Result<Self::Ciphertext, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Serialization` if serialization fails.
    fn serialize_context(&self, ctx: &Self::Context) -> Result<Vec<u8>, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::InvalidKeyFormat` if the bytes are not a context.
    fn deserialize_context(&self, bytes: &[u8]) -> Result<Self::Context, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Serialization` if serialization fails.
    fn serialize_public_key(&self, pk: &Self::PublicKey) -> Result<Vec<u8>, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::InvalidKeyFormat` if the bytes do not match `ctx`.
    fn deserialize_public_key(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::PublicKey, CryptoError>;

    /// Serialized secret key; wiped from memory on drop.
    ///
    /// # Errors
    /// Returns `CryptoError::Serialization` if serialization fails.
    fn serialize_secret_key(&self, sk: &Self::SecretKey)
        -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::InvalidKeyFormat` if the bytes do not match `ctx`.
    fn deserialize_secret_key(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::SecretKey, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::Serialization` if serialization fails.
    fn serialize_ciphertext(&self, ct: &Self::Ciphertext) -> Result<Vec<u8>, CryptoError>;

    /// # Errors
    /// Returns `CryptoError::InvalidKeyFormat` if the bytes do not match `ctx`.
    fn deserialize_ciphertext(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::Ciphertext, CryptoError>;
}
