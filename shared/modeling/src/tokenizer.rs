use tessera_core::LogicalAxis;

/// The tokenizer capability the trainer needs: a vocabulary size to
/// build the vocab axis from, and a padding id for fixed-shape batches.
/// Real tokenization happens upstream of the data pipeline.
pub trait Tokenizer: Send + Sync {
    fn vocab_size(&self) -> usize;
    fn pad_token_id(&self) -> i32;

    fn vocab_axis(&self) -> LogicalAxis {
        LogicalAxis::new("vocab", self.vocab_size())
    }
}

/// A fixed-vocabulary tokenizer handle, enough for pre-tokenized data.
#[derive(Debug, Clone, Copy)]
pub struct StaticTokenizer {
    pub vocab_size: usize,
    pub pad_token_id: i32,
}

impl Tokenizer for StaticTokenizer {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn pad_token_id(&self) -> i32 {
        self.pad_token_id
    }
}
