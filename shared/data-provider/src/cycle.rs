use tracing::debug;

use crate::traits::{DataProvider, DataProviderError, TokenizedData};

/// Restarts the wrapped provider whenever it runs dry, so the stream
/// never reports end of stream. Cycling is explicit: a provider is only
/// infinite if the caller wrapped it in `Cycle`.
pub struct Cycle<P> {
    inner: P,
    epoch: u64,
}

impl<P: DataProvider> Cycle<P> {
    pub fn new(inner: P) -> Self {
        Self { inner, epoch: 0 }
    }

    /// How many times the underlying stream has been restarted.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<P: DataProvider> DataProvider for Cycle<P> {
    fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<TokenizedData>>, DataProviderError> {
        if let Some(batch) = self.inner.next_batch(batch_size)? {
            return Ok(Some(batch));
        }
        self.epoch += 1;
        debug!(epoch = self.epoch, "data stream exhausted, restarting");
        self.inner.restart();
        match self.inner.next_batch(batch_size)? {
            Some(batch) => Ok(Some(batch)),
            // a freshly restarted source that still yields nothing can
            // never produce a batch of this size
            None => Err(DataProviderError::EmptySource),
        }
    }

    fn restart(&mut self) {
        self.epoch = 0;
        self.inner.restart();
    }
}
