//! Oblivious matching: the per-chunk homomorphic equality test.
//!
//! For a chunk of candidates the evaluator
//! 1. scatters candidate `j`'s encrypted mask into slot `j`,
//! 2. adds the client's encrypted negated mask to every slot,
//! 3. multiplies together `x + d` for every `d` in the match window, which
//!    is zero exactly when the slot value lies inside the window,
//! 4. multiplies each slot by a fresh random value in `1..=256`.
//!
//! The client learns which slots are zero and nothing about how far a
//! non-matching slot was from the query.

use rand::Rng;

use crate::domain::mask::MATCH_WINDOW;
use crate::domain::CryptoError;
use crate::ports::FheEngine;

/// Inclusive range of blinding multipliers.
pub const BLIND_MIN: i64 = 1;
pub const BLIND_MAX: i64 = 256;

/// Evaluates chunks for one query against one key.
///
/// Indicator and window plaintexts are encoded once and shared by every
/// chunk of the query.
pub struct MatchEvaluator<'a, E: FheEngine> {
    engine: &'a E,
    ctx: &'a E::Context,
    pk: &'a E::PublicKey,
    indicators: Vec<E::Plaintext>,
    window: Vec<E::Plaintext>,
}

impl<'a, E: FheEngine> MatchEvaluator<'a, E> {
    /// # Errors
    /// Returns `CryptoError::InvalidParameters` if a chunk cannot fit in one
    /// ciphertext, or an encoding error from the engine.
    pub fn new(
        engine: &'a E,
        ctx: &'a E::Context,
        pk: &'a E::PublicKey,
        chunk_size: usize,
    ) -> Result<Self, CryptoError> {
        let slots = engine.slot_count(ctx);
        if chunk_size == 0 || chunk_size > slots {
            return Err(CryptoError::InvalidParameters(format!(
                "chunk size {chunk_size} does not fit {slots} slots"
            )));
        }

        let indicators = (0..chunk_size)
            .map(|j| {
                let mut one_hot = vec![0; j + 1];
                one_hot[j] = 1;
                engine.encode_slots(ctx, &one_hot)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let window = (-MATCH_WINDOW..=MATCH_WINDOW)
            .map(|d| engine.encode_slots(ctx, &vec![d; slots]))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            engine,
            ctx,
            pk,
            indicators,
            window,
        })
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.indicators.len()
    }

    #[must_use]
    pub fn engine(&self) -> &'a E {
        self.engine
    }

    #[must_use]
    pub fn context(&self) -> &'a E::Context {
        self.ctx
    }

    /// Blinded equality test of `masks` (one per candidate, in slot order)
    /// against the broadcast negated query mask.
    ///
    /// # Errors
    /// Returns `CryptoError::Computation` if the chunk is larger than the
    /// evaluator was built for, or any homomorphic operation fails.
    pub fn evaluate_chunk(
        &self,
        masks: &[E::Ciphertext],
        negated_query: &E::Ciphertext,
    ) -> Result<E::Ciphertext, CryptoError> {
        if masks.len() > self.indicators.len() {
            return Err(CryptoError::Computation(format!(
                "{} candidates exceed chunk size {}",
                masks.len(),
                self.indicators.len()
            )));
        }

        let mut acc = self.engine.encrypt(self.ctx, self.pk, 0)?;
        for (mask, indicator) in masks.iter().zip(&self.indicators) {
            let scattered = self.engine.multiply_plain(mask, indicator)?;
            acc = self.engine.add(&acc, &scattered)?;
        }
        let diff = self.engine.add(&acc, negated_query)?;

        let shifted = self
            .window
            .iter()
            .map(|d| self.engine.add_plain(&diff, d))
            .collect::<Result<Vec<_>, _>>()?;
        let product = self.product_tree(shifted)?;
        self.blind(&product)
    }

    /// Multiply all factors pairwise, level by level; an odd factor out is
    /// carried to the next level unchanged. Eleven factors need depth four.
    fn product_tree(&self, mut level: Vec<E::Ciphertext>) -> Result<E::Ciphertext, CryptoError> {
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [a, b] => self.engine.multiply(self.pk, a, b),
                    [a] => Ok(a.clone()),
                    _ => Err(CryptoError::Computation("empty product level".into())),
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        level
            .pop()
            .ok_or_else(|| CryptoError::Computation("empty product".into()))
    }

    fn blind(&self, ct: &E::Ciphertext) -> Result<E::Ciphertext, CryptoError> {
        let mut rng = rand::thread_rng();
        let factors: Vec<i64> = (0..self.engine.slot_count(self.ctx))
            .map(|_| rng.gen_range(BLIND_MIN..=BLIND_MAX))
            .collect();
        let pt = self.engine.encode_slots(self.ctx, &factors)?;
        self.engine.multiply_plain(ct, &pt)
    }
}

/// Plaintext counterpart of the window product, over `Z_t`.
#[must_use]
pub fn range_zero_product(x: i64, modulus: u64) -> u64 {
    let t = i128::from(modulus);
    let product = (-MATCH_WINDOW..=MATCH_WINDOW).fold(1_i128, |acc, d| {
        (acc * (i128::from(x) + i128::from(d)).rem_euclid(t)) % t
    });
    // `product` is in `0..t`, which fits since `modulus` does.
    u64::try_from(product).unwrap_or_default()
}

/// Plaintext counterpart of blinding one slot.
#[must_use]
pub fn blind_value(value: u64, factor: u64, modulus: u64) -> u64 {
    let product = u128::from(value % modulus) * u128::from(factor % modulus);
    u64::try_from(product % u128::from(modulus)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bfv::BfvEngine;
    use crate::domain::{compute_mask, ContextSettings, Gender};
    use quickcheck_macros::quickcheck;

    const T: u64 = 65537;

    #[test]
    fn test_range_zero_product_window() {
        for x in -10..=10 {
            let zero = range_zero_product(x, T) == 0;
            assert_eq!(zero, (-5..=5).contains(&x), "x = {x}");
        }
    }

    #[test]
    fn test_distinct_profiles_fall_outside_window() {
        let query = compute_mask(30, Gender::Male).unwrap();
        for (age, gender) in [(36, Gender::Male), (24, Gender::Male), (30, Gender::Female)] {
            let candidate = compute_mask(age, gender).unwrap();
            assert_ne!(range_zero_product(candidate - query, T), 0);
        }
    }

    #[quickcheck]
    fn prop_blinding_preserves_zeroness(value: u64, factor: u16) -> bool {
        let factor = u64::from(factor % 256) + 1;
        let blinded = blind_value(value, factor, T);
        (blinded == 0) == (value % T == 0)
    }

    fn settings() -> ContextSettings {
        ContextSettings {
            degree: 2048,
            plaintext_modulus: T,
            moduli_sizes: vec![62; 5],
        }
    }

    #[test]
    fn test_evaluate_chunk_marks_matching_slots() {
        let engine = BfvEngine::new();
        let ctx = engine.create_context(&settings()).unwrap();
        let (pk, sk) = engine.generate_keys(&ctx).unwrap();
        let evaluator = MatchEvaluator::new(&engine, &ctx, &pk, 100).unwrap();

        let query = compute_mask(30, Gender::Male).unwrap();
        let candidates = [
            compute_mask(30, Gender::Male).unwrap(),
            compute_mask(35, Gender::Female).unwrap(),
            compute_mask(37, Gender::Male).unwrap(),
            // Within the age window.
            compute_mask(33, Gender::Male).unwrap(),
        ];
        let masks: Vec<_> = candidates
            .iter()
            .map(|&m| engine.encrypt(&ctx, &pk, m).unwrap())
            .collect();
        let negated = engine.encrypt(&ctx, &pk, -query).unwrap();

        let ct = evaluator.evaluate_chunk(&masks, &negated).unwrap();
        let slots = engine.decrypt(&ctx, &sk, &ct).unwrap();

        assert_eq!(slots[0], 0);
        assert_ne!(slots[1], 0);
        assert_ne!(slots[2], 0);
        assert_eq!(slots[3], 0);
    }

    #[test]
    fn test_oversized_chunk_is_rejected() {
        let engine = BfvEngine::new();
        let ctx = engine.create_context(&settings()).unwrap();
        let (pk, _) = engine.generate_keys(&ctx).unwrap();

        assert!(MatchEvaluator::new(&engine, &ctx, &pk, 4096).is_err());

        let evaluator = MatchEvaluator::new(&engine, &ctx, &pk, 2).unwrap();
        let ct = engine.encrypt(&ctx, &pk, 1).unwrap();
        let masks = vec![ct.clone(); 3];
        assert!(matches!(
            evaluator.evaluate_chunk(&masks, &ct),
            Err(CryptoError::Computation(_))
        ));
    }
}
