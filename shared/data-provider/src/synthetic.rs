use rand::Rng;
use tessera_core::RngKey;

use crate::traits::{DataProvider, DataProviderError, TokenizedData};

/// Deterministic synthetic token stream.
///
/// Sequence `i` is generated from `key.fold_in(i)`, so the content of a
/// sequence depends only on the seed and its index, never on how the
/// stream was consumed to reach it.
pub struct SyntheticTokenProvider {
    key: RngKey,
    vocab_size: i32,
    seq_len: usize,
    num_sequences: Option<usize>,
    cursor: usize,
}

impl SyntheticTokenProvider {
    pub fn new(seed: u64, vocab_size: i32, seq_len: usize) -> Self {
        Self {
            key: RngKey::from_seed(seed),
            vocab_size,
            seq_len,
            num_sequences: None,
            cursor: 0,
        }
    }

    /// Limit the stream to `num_sequences` sequences, after which
    /// `next_batch` reports end of stream.
    pub fn with_length(mut self, num_sequences: usize) -> Self {
        self.num_sequences = Some(num_sequences);
        self
    }

    fn sequence(&self, index: usize) -> TokenizedData {
        let mut rng = self.key.fold_in(index as u64).into_rng();
        let tokens = (0..self.seq_len)
            .map(|_| rng.gen_range(0..self.vocab_size))
            .collect();
        TokenizedData::from_input_ids(tokens)
    }
}

impl DataProvider for SyntheticTokenProvider {
    fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<TokenizedData>>, DataProviderError> {
        if let Some(limit) = self.num_sequences {
            if self.cursor + batch_size > limit {
                return Ok(None);
            }
        }
        let batch = (0..batch_size)
            .map(|i| self.sequence(self.cursor + i))
            .collect();
        self.cursor += batch_size;
        Ok(Some(batch))
    }

    fn restart(&mut self) {
        self.cursor = 0;
    }

    fn skip_batches(&mut self, n: usize, batch_size: usize) -> Result<(), DataProviderError> {
        // sequences are addressable by index, no need to materialize them
        let wanted = n * batch_size;
        if let Some(limit) = self.num_sequences {
            let remaining_batches = (limit - self.cursor.min(limit)) / batch_size;
            if remaining_batches < n {
                return Err(DataProviderError::ExhaustedDuringSkip {
                    consumed: remaining_batches,
                    requested: n,
                });
            }
        }
        self.cursor += wanted;
        Ok(())
    }
}
