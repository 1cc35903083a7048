use rand::seq::SliceRandom;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::traits::{DataProvider, DataProviderError, Shuffle, TokenizedData};

/// A finite dataset held in memory, visited in a fixed (optionally
/// seed-shuffled) order. The shuffle happens once at construction, so
/// `restart` replays the exact same order.
pub struct InMemoryDataProvider {
    sequences: Vec<TokenizedData>,
    order: Vec<usize>,
    cursor: usize,
}

impl InMemoryDataProvider {
    pub fn new(
        sequences: Vec<TokenizedData>,
        shuffle: Shuffle,
    ) -> Result<Self, DataProviderError> {
        if sequences.is_empty() {
            return Err(DataProviderError::EmptySource);
        }
        let mut order: Vec<usize> = (0..sequences.len()).collect();
        if let Shuffle::Seeded(seed) = shuffle {
            let mut rng = ChaCha8Rng::from_seed(seed);
            order.shuffle(&mut rng);
        }
        Ok(Self {
            sequences,
            order,
            cursor: 0,
        })
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }
}

impl DataProvider for InMemoryDataProvider {
    fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<TokenizedData>>, DataProviderError> {
        if self.cursor + batch_size > self.order.len() {
            return Ok(None);
        }
        let batch = self.order[self.cursor..self.cursor + batch_size]
            .iter()
            .map(|&i| self.sequences[i].clone())
            .collect();
        self.cursor += batch_size;
        Ok(Some(batch))
    }

    fn restart(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i32) -> Vec<TokenizedData> {
        (0..n)
            .map(|i| TokenizedData::from_input_ids(vec![i, i + 1]))
            .collect()
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            InMemoryDataProvider::new(vec![], Shuffle::DontShuffle),
            Err(DataProviderError::EmptySource)
        ));
    }

    #[test]
    fn unshuffled_preserves_order() {
        let mut p = InMemoryDataProvider::new(rows(4), Shuffle::DontShuffle).unwrap();
        let batch = p.next_batch(2).unwrap().unwrap();
        assert_eq!(batch[0].input_ids(), &[0, 1]);
        assert_eq!(batch[1].input_ids(), &[1, 2]);
    }

    #[test]
    fn shuffle_is_stable_across_restart() {
        let mut p = InMemoryDataProvider::new(rows(32), Shuffle::Seeded([9u8; 32])).unwrap();
        let first = p.next_batch(32).unwrap().unwrap();
        assert!(p.next_batch(1).unwrap().is_none());
        p.restart();
        let again = p.next_batch(32).unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn seeded_shuffles_agree_between_instances() {
        let mut a = InMemoryDataProvider::new(rows(32), Shuffle::Seeded([1u8; 32])).unwrap();
        let mut b = InMemoryDataProvider::new(rows(32), Shuffle::Seeded([1u8; 32])).unwrap();
        assert_eq!(a.next_batch(32).unwrap(), b.next_batch(32).unwrap());
    }
}
