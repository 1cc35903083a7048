use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// A splittable deterministic random stream token, in the style of a
/// functional PRNG: every consumption is a pure split producing
/// independent child keys, and no key is ever consumed twice.
///
/// The training loop owns one `RngKey` thread; each step splits off a
/// step key and keeps the remainder for future steps, which makes RNG
/// consumption order a pure function of the seed and the step count.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey([u8; 32]);

impl RngKey {
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&seed.to_le_bytes());
        // diffuse the seed so nearby seeds don't share a prefix
        Self(bytes).derive_child(0)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    fn derive_child(&self, index: u64) -> RngKey {
        let mut rng = ChaCha8Rng::from_seed(self.0);
        rng.set_stream(index);
        let mut child = [0u8; 32];
        rng.fill_bytes(&mut child);
        RngKey(child)
    }

    /// Split this key into `(my_key, next_key)`. The caller must not
    /// reuse `self` afterwards.
    pub fn split(self) -> (RngKey, RngKey) {
        (self.derive_child(1), self.derive_child(2))
    }

    /// Derive `n` independent child keys, one per example in a batch.
    pub fn split_many(self, n: usize) -> Vec<RngKey> {
        (0..n).map(|i| self.derive_child(3 + i as u64)).collect()
    }

    /// Mix `data` into the key, producing a new independent key.
    ///
    /// Folded keys live in their own domain: a tag is mixed into the
    /// high bytes so `fold_in(0)` never aliases a `split` or
    /// `split_many` child of the same key.
    pub fn fold_in(self, data: u64) -> RngKey {
        const FOLD_TAG: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut bytes = self.0;
        for (i, b) in data.to_le_bytes().iter().enumerate() {
            bytes[i] ^= b;
        }
        for (i, b) in FOLD_TAG.to_le_bytes().iter().enumerate() {
            bytes[24 + i] ^= b;
        }
        RngKey(bytes).derive_child(0)
    }

    /// Consume the key as a concrete random stream.
    pub fn into_rng(self) -> ChaCha8Rng {
        ChaCha8Rng::from_seed(self.0)
    }

    /// Draw a uniform sample in `[0, 1)`, consuming the key.
    pub fn uniform(self) -> f64 {
        self.into_rng().gen_range(0.0..1.0)
    }
}

impl std::fmt::Debug for RngKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RngKey({}..)", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn split_is_pure() {
        let key = RngKey::from_seed(42);
        assert_eq!(key.split(), key.split());
    }

    #[test]
    fn children_are_distinct() {
        let key = RngKey::from_seed(7);
        let (a, b) = key.split();
        assert_ne!(a, b);
        assert_ne!(a, key);
        assert_ne!(b, key);
    }

    #[test]
    fn no_key_reuse_across_steps() {
        let mut training_key = RngKey::from_seed(0);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let (my_key, next) = training_key.split();
            training_key = next;
            for example_key in my_key.split_many(8) {
                assert!(seen.insert(example_key.to_bytes()));
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn fold_in_differs_by_data() {
        let key = RngKey::from_seed(1);
        assert_ne!(key.fold_in(0), key.fold_in(1));
        assert_eq!(key.fold_in(5), key.fold_in(5));
    }

    #[test]
    fn fold_in_never_aliases_split_children() {
        let key = RngKey::from_seed(9);
        let (a, b) = key.split();
        let children = key.split_many(16);
        for data in 0..16u64 {
            let folded = key.fold_in(data);
            assert_ne!(folded, a);
            assert_ne!(folded, b);
            assert!(!children.contains(&folded));
        }
    }
}
