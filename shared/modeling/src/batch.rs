use tessera_core::RngKey;

/// One training example: a fixed-length token sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub tokens: Vec<i32>,
}

impl Example {
    pub fn new(tokens: Vec<i32>) -> Self {
        Self { tokens }
    }
}

/// A logical batch with a leading batch dimension.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub examples: Vec<Example>,
}

impl Batch {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn size(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// A microbatch slice paired with its per-example RNG keys.
#[derive(Debug, Clone)]
pub struct KeyedExamples {
    pub examples: Vec<Example>,
    pub keys: Vec<RngKey>,
}
