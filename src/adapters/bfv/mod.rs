//! BFV adapter: Implementation of `FheEngine` using fhe.rs.
//!
//! Slot packing (`Encoding::simd`) gives one independent integer lane per
//! ring coefficient, which is what the chunked equality test relies on.
//!
//! # Key material
//!
//! - The public bundle carries the encryption key and the relinearization key.
//!   Both are needed server-side: the first to start accumulators, the second
//!   after every ciphertext product.
//! - The secret key is persisted as the 32-byte seed it was sampled from and
//!   re-derived on load. The seed lives in `Zeroizing` buffers only.

use std::sync::Arc;

use fhe::bfv::{
    BfvParameters, BfvParametersBuilder, Ciphertext, Encoding, Plaintext, PublicKey,
    RelinearizationKey, SecretKey,
};
use fhe_traits::{
    Deserialize as FheDeserialize, DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder,
    FheEncrypter, Serialize as FheSerialize,
};
use rand::{rngs::OsRng, RngCore, SeedableRng, TryRngCore};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::domain::{fingerprint, ContextSettings, CryptoError};
use crate::ports::FheEngine;

/// Length of the secret-key seed.
const SEED_LEN: usize = 32;

/// Public key plus the relinearization key derived from the same secret.
pub struct BfvPublicKey {
    pk: PublicKey,
    rk: RelinearizationKey,
}

impl std::fmt::Debug for BfvPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfvPublicKey")
            .field("fingerprint", &fingerprint(&self.pk.to_bytes()))
            .finish_non_exhaustive()
    }
}

/// Secret key together with the seed it was sampled from.
pub struct BfvSecretKey {
    seed: Zeroizing<[u8; SEED_LEN]>,
    sk: SecretKey,
}

impl std::fmt::Debug for BfvSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfvSecretKey")
            .field("seed", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct PublicKeyBundle {
    pk: Vec<u8>,
    rk: Vec<u8>,
}

/// BFV engine. Stateless; all parameters travel in the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct BfvEngine;

impl BfvEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn secret_key_from_seed(par: &Arc<BfvParameters>, seed: [u8; SEED_LEN]) -> BfvSecretKey {
        let mut rng = ChaCha20Rng::from_seed(seed);
        let sk = SecretKey::random(par, &mut rng);
        BfvSecretKey {
            seed: Zeroizing::new(seed),
            sk,
        }
    }

    fn reduce(par: &BfvParameters, values: &[i64]) -> Vec<u64> {
        let t = par.plaintext() as i64;
        values.iter().map(|v| v.rem_euclid(t) as u64).collect()
    }

    fn center(par: &BfvParameters, values: Vec<u64>) -> Vec<i64> {
        let t = par.plaintext();
        values
            .into_iter()
            .map(|v| {
                if v > t / 2 {
                    v as i64 - t as i64
                } else {
                    v as i64
                }
            })
            .collect()
    }
}

impl FheEngine for BfvEngine {
    type Context = Arc<BfvParameters>;
    type PublicKey = BfvPublicKey;
    type SecretKey = BfvSecretKey;
    type Ciphertext = Ciphertext;
    type Plaintext = Plaintext;

    fn create_context(&self, settings: &ContextSettings) -> Result<Self::Context, CryptoError> {
        settings.validate()?;
        BfvParametersBuilder::new()
            .set_degree(settings.degree)
            .set_plaintext_modulus(settings.plaintext_modulus)
            .set_moduli_sizes(&settings.moduli_sizes)
            .build_arc()
            .map_err(|e| CryptoError::InvalidParameters(e.to_string()))
    }

    fn generate_keys(
        &self,
        ctx: &Self::Context,
    ) -> Result<(Self::PublicKey, Self::SecretKey), CryptoError> {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        OsRng.unwrap_err().fill_bytes(seed.as_mut());
        let secret = Self::secret_key_from_seed(ctx, *seed);

        let mut rng = OsRng.unwrap_err();
        let pk = PublicKey::new(&secret.sk, &mut rng);
        let rk = RelinearizationKey::new(&secret.sk, &mut rng)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        tracing::debug!(
            fingerprint = %fingerprint(&pk.to_bytes()),
            degree = ctx.degree(),
            "Generated BFV key pair"
        );
        Ok((BfvPublicKey { pk, rk }, secret))
    }

    fn slot_count(&self, ctx: &Self::Context) -> usize {
        ctx.degree()
    }

    fn encode_slots(
        &self,
        ctx: &Self::Context,
        values: &[i64],
    ) -> Result<Self::Plaintext, CryptoError> {
        if values.len() > ctx.degree() {
            return Err(CryptoError::Encryption(format!(
                "{} values exceed {} slots",
                values.len(),
                ctx.degree()
            )));
        }
        let reduced = Self::reduce(ctx, values);
        Plaintext::try_encode(&reduced[..], Encoding::simd(), ctx)
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    fn encrypt_slots(
        &self,
        ctx: &Self::Context,
        pk: &Self::PublicKey,
        values: &[i64],
    ) -> Result<Self::Ciphertext, CryptoError> {
        let pt = self.encode_slots(ctx, values)?;
        pk.pk
            .try_encrypt(&pt, &mut OsRng.unwrap_err())
            .map_err(|e| CryptoError::Encryption(e.to_string()))
    }

    fn decrypt(
        &self,
        ctx: &Self::Context,
        sk: &Self::SecretKey,
        ct: &Self::Ciphertext,
    ) -> Result<Vec<i64>, CryptoError> {
        let pt = sk
            .sk
            .try_decrypt(ct)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let values = Vec::<u64>::try_decode(&pt, Encoding::simd())
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        Ok(Self::center(ctx, values))
    }

    fn add(
        &self,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CryptoError> {
        Ok(a + b)
    }

    fn add_plain(
        &self,
        a: &Self::Ciphertext,
        p: &Self::Plaintext,
    ) -> Result<Self::Ciphertext, CryptoError> {
        Ok(a + p)
    }

    fn multiply(
        &self,
        pk: &Self::PublicKey,
        a: &Self::Ciphertext,
        b: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, CryptoError> {
        let mut product = a * b;
        pk.rk
            .relinearizes(&mut product)
            .map_err(|e| CryptoError::Computation(e.to_string()))?;
        Ok(product)
    }

    fn multiply_plain(
        &self,
        a: &Self::Ciphertext,
        p: &Self::Plaintext,
    ) -> Result<Self::Ciphertext, CryptoError> {
        Ok(a * p)
    }

    fn serialize_context(&self, ctx: &Self::Context) -> Result<Vec<u8>, CryptoError> {
        Ok(ctx.to_bytes())
    }

    fn deserialize_context(&self, bytes: &[u8]) -> Result<Self::Context, CryptoError> {
        BfvParameters::try_deserialize(bytes)
            .map(Arc::new)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("context: {e}")))
    }

    fn serialize_public_key(&self, pk: &Self::PublicKey) -> Result<Vec<u8>, CryptoError> {
        let bundle = PublicKeyBundle {
            pk: pk.pk.to_bytes(),
            rk: pk.rk.to_bytes(),
        };
        bincode::serialize(&bundle).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    fn deserialize_public_key(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::PublicKey, CryptoError> {
        let bundle: PublicKeyBundle = bincode::deserialize(bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("public key bundle: {e}")))?;
        let pk = PublicKey::from_bytes(&bundle.pk, ctx)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("public key: {e}")))?;
        let rk = RelinearizationKey::from_bytes(&bundle.rk, ctx)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("relinearization key: {e}")))?;
        Ok(BfvPublicKey { pk, rk })
    }

    fn serialize_secret_key(
        &self,
        sk: &Self::SecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        Ok(Zeroizing::new(sk.seed.to_vec()))
    }

    fn deserialize_secret_key(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::SecretKey, CryptoError> {
        let seed: [u8; SEED_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyFormat(format!(
                "secret key seed must be {SEED_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        let seed = Zeroizing::new(seed);
        Ok(Self::secret_key_from_seed(ctx, *seed))
    }

    fn serialize_ciphertext(&self, ct: &Self::Ciphertext) -> Result<Vec<u8>, CryptoError> {
        Ok(ct.to_bytes())
    }

    fn deserialize_ciphertext(
        &self,
        ctx: &Self::Context,
        bytes: &[u8],
    ) -> Result<Self::Ciphertext, CryptoError> {
        Ciphertext::from_bytes(bytes, ctx)
            .map_err(|e| CryptoError::InvalidKeyFormat(format!("ciphertext: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> ContextSettings {
        ContextSettings {
            degree: 2048,
            plaintext_modulus: 65537,
            moduli_sizes: vec![62, 62, 62, 62, 62],
        }
    }

    fn setup() -> (BfvEngine, Arc<BfvParameters>, BfvPublicKey, BfvSecretKey) {
        let engine = BfvEngine::new();
        let ctx = engine.create_context(&small_settings()).expect("context");
        let (pk, sk) = engine.generate_keys(&ctx).expect("keys");
        (engine, ctx, pk, sk)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (engine, ctx, pk, sk) = setup();
        let ct = engine
            .encrypt_slots(&ctx, &pk, &[3, -7, 0, 383])
            .expect("encrypt");
        let slots = engine.decrypt(&ctx, &sk, &ct).expect("decrypt");

        assert_eq!(slots.len(), engine.slot_count(&ctx));
        assert_eq!(&slots[..4], &[3, -7, 0, 383]);
        assert!(slots[4..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_broadcast_encrypt() {
        let (engine, ctx, pk, sk) = setup();
        let ct = engine.encrypt(&ctx, &pk, -35).expect("encrypt");
        let slots = engine.decrypt(&ctx, &sk, &ct).expect("decrypt");
        assert!(slots.iter().all(|&v| v == -35));
    }

    #[test]
    fn test_homomorphic_arithmetic() {
        let (engine, ctx, pk, sk) = setup();
        let a = engine.encrypt_slots(&ctx, &pk, &[2, 3, 4]).expect("encrypt a");
        let b = engine.encrypt_slots(&ctx, &pk, &[5, -1, 0]).expect("encrypt b");
        let p = engine.encode_slots(&ctx, &[1, 1, 10]).expect("encode");

        let sum = engine.add(&a, &b).expect("add");
        let product = engine.multiply(&pk, &a, &b).expect("multiply");
        let shifted = engine.add_plain(&a, &p).expect("add plain");
        let scaled = engine.multiply_plain(&a, &p).expect("multiply plain");

        assert_eq!(&engine.decrypt(&ctx, &sk, &sum).unwrap()[..3], &[7, 2, 4]);
        assert_eq!(&engine.decrypt(&ctx, &sk, &product).unwrap()[..3], &[10, -3, 0]);
        assert_eq!(&engine.decrypt(&ctx, &sk, &shifted).unwrap()[..3], &[3, 4, 14]);
        assert_eq!(&engine.decrypt(&ctx, &sk, &scaled).unwrap()[..3], &[2, 3, 40]);
    }

    #[test]
    fn test_key_serialization_roundtrip() {
        let (engine, ctx, pk, sk) = setup();

        let ctx_bytes = engine.serialize_context(&ctx).expect("ctx bytes");
        let ctx2 = engine.deserialize_context(&ctx_bytes).expect("ctx");
        let pk2 = engine
            .deserialize_public_key(&ctx2, &engine.serialize_public_key(&pk).unwrap())
            .expect("pk");
        let sk_bytes = engine.serialize_secret_key(&sk).expect("sk bytes");
        assert_eq!(sk_bytes.len(), SEED_LEN);
        let sk2 = engine.deserialize_secret_key(&ctx2, &sk_bytes).expect("sk");

        // Encrypt under the restored public key, decrypt under the original secret.
        let ct = engine.encrypt_slots(&ctx2, &pk2, &[11, 12]).expect("encrypt");
        let ct_bytes = engine.serialize_ciphertext(&ct).expect("ct bytes");
        let ct = engine.deserialize_ciphertext(&ctx, &ct_bytes).expect("ct");
        assert_eq!(&engine.decrypt(&ctx, &sk, &ct).unwrap()[..2], &[11, 12]);
        assert_eq!(&engine.decrypt(&ctx2, &sk2, &ct).unwrap()[..2], &[11, 12]);
    }

    #[test]
    fn test_secret_key_rejects_wrong_length() {
        let (engine, ctx, _pk, _sk) = setup();
        assert!(matches!(
            engine.deserialize_secret_key(&ctx, &[0u8; 16]),
            Err(CryptoError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_key_debug_does_not_leak() {
        let (_engine, _ctx, pk, sk) = setup();
        let seed_hex: String = sk.seed.iter().map(|b| format!("{b:02x}")).collect();
        assert!(!format!("{sk:?}").contains(&seed_hex));
        assert!(format!("{pk:?}").contains("fingerprint"));
    }
}
