use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataProviderError {
    #[error("data source is empty")]
    EmptySource,

    #[error("stream ended after {consumed} of {requested} batches while skipping")]
    ExhaustedDuringSkip { consumed: usize, requested: usize },

    #[error("mixture weight {0} is not in [0, 1]")]
    InvalidMixtureWeight(f64),
}

/// One tokenized training sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedData {
    input_ids: Vec<i32>,
}

impl TokenizedData {
    pub fn from_input_ids(input_ids: Vec<i32>) -> Self {
        Self { input_ids }
    }

    pub fn input_ids(&self) -> &[i32] {
        &self.input_ids
    }

    pub fn into_input_ids(self) -> Vec<i32> {
        self.input_ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    DontShuffle,
    Seeded([u8; 32]),
}

/// A restartable stream of tokenized batches.
///
/// Every provider is a pure function of its construction arguments:
/// `restart` followed by the same sequence of `next_batch` calls yields
/// the same batches, which is what makes training runs resumable.
pub trait DataProvider: Send {
    /// The next batch of `batch_size` sequences, or `None` once the
    /// underlying stream is exhausted.
    fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<TokenizedData>>, DataProviderError>;

    /// Rewind to the state immediately after construction.
    fn restart(&mut self);

    /// Discard the next `n` batches. Equivalent to `n` calls to
    /// `next_batch`; resuming a run at step `s` skips `s` batches so the
    /// data order matches an uninterrupted run.
    fn skip_batches(&mut self, n: usize, batch_size: usize) -> Result<(), DataProviderError> {
        for consumed in 0..n {
            if self.next_batch(batch_size)?.is_none() {
                return Err(DataProviderError::ExhaustedDuringSkip {
                    consumed,
                    requested: n,
                });
            }
        }
        Ok(())
    }
}
