use tessera_core::RngKey;
use tracing::trace;

use crate::traits::{DataProvider, DataProviderError, TokenizedData};

/// Draws each batch from one of two component streams, chosen by an
/// independent seeded coin flip per batch. Flip `i` depends only on the
/// key and `i`, so a resumed run that skips ahead sees the same choices
/// an uninterrupted run would have.
pub struct MixtureProvider<A, B> {
    primary: A,
    secondary: B,
    secondary_weight: f64,
    key: RngKey,
    draws: u64,
}

impl<A: DataProvider, B: DataProvider> MixtureProvider<A, B> {
    /// `secondary_weight` is the probability of drawing from
    /// `secondary` on any given batch.
    pub fn new(
        primary: A,
        secondary: B,
        secondary_weight: f64,
        key: RngKey,
    ) -> Result<Self, DataProviderError> {
        if !(0.0..=1.0).contains(&secondary_weight) {
            return Err(DataProviderError::InvalidMixtureWeight(secondary_weight));
        }
        Ok(Self {
            primary,
            secondary,
            secondary_weight,
            key,
            draws: 0,
        })
    }
}

impl<A: DataProvider, B: DataProvider> DataProvider for MixtureProvider<A, B> {
    fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<TokenizedData>>, DataProviderError> {
        let coin = self.key.fold_in(self.draws).uniform();
        self.draws += 1;
        let take_secondary = coin < self.secondary_weight;
        trace!(draw = self.draws - 1, coin, take_secondary, "mixture draw");
        if take_secondary {
            self.secondary.next_batch(batch_size)
        } else {
            self.primary.next_batch(batch_size)
        }
    }

    fn restart(&mut self) {
        self.draws = 0;
        self.primary.restart();
        self.secondary.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::Cycle;
    use crate::memory::InMemoryDataProvider;
    use crate::traits::Shuffle;

    fn constant(token: i32) -> Cycle<InMemoryDataProvider> {
        let rows = vec![TokenizedData::from_input_ids(vec![token]); 4];
        Cycle::new(InMemoryDataProvider::new(rows, Shuffle::DontShuffle).unwrap())
    }

    #[test]
    fn rejects_weight_out_of_range() {
        assert!(matches!(
            MixtureProvider::new(constant(0), constant(1), 1.5, RngKey::from_seed(1)),
            Err(DataProviderError::InvalidMixtureWeight(_))
        ));
    }

    #[test]
    fn weight_zero_only_draws_primary() {
        let mut p =
            MixtureProvider::new(constant(0), constant(1), 0.0, RngKey::from_seed(1)).unwrap();
        for _ in 0..20 {
            let batch = p.next_batch(2).unwrap().unwrap();
            assert_eq!(batch[0].input_ids()[0], 0);
        }
    }

    #[test]
    fn weight_one_only_draws_secondary() {
        let mut p =
            MixtureProvider::new(constant(0), constant(1), 1.0, RngKey::from_seed(1)).unwrap();
        for _ in 0..20 {
            let batch = p.next_batch(2).unwrap().unwrap();
            assert_eq!(batch[0].input_ids()[0], 1);
        }
    }

    #[test]
    fn draws_are_deterministic_for_a_key() {
        let key = RngKey::from_seed(42);
        let mut a = MixtureProvider::new(constant(0), constant(1), 0.3, key).unwrap();
        let mut b = MixtureProvider::new(constant(0), constant(1), 0.3, key).unwrap();
        for _ in 0..50 {
            assert_eq!(a.next_batch(1).unwrap(), b.next_batch(1).unwrap());
        }
    }

    #[test]
    fn both_sources_appear_at_intermediate_weight() {
        let mut p =
            MixtureProvider::new(constant(0), constant(1), 0.5, RngKey::from_seed(7)).unwrap();
        let mut seen = [false, false];
        for _ in 0..100 {
            let batch = p.next_batch(1).unwrap().unwrap();
            seen[batch[0].input_ids()[0] as usize] = true;
        }
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn restart_replays_the_same_choices() {
        let mut p =
            MixtureProvider::new(constant(0), constant(1), 0.5, RngKey::from_seed(9)).unwrap();
        let first: Vec<_> = (0..16).map(|_| p.next_batch(1).unwrap().unwrap()).collect();
        p.restart();
        let again: Vec<_> = (0..16).map(|_| p.next_batch(1).unwrap().unwrap()).collect();
        assert_eq!(first, again);
    }
}
