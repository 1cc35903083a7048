mod accumulator;
mod batch;
mod models;
mod optimizer;
mod param_tree;
mod pretrained;
mod safetensor_utils;
mod tensor;
mod tokenizer;

pub use accumulator::{AccumulatorError, ShardedAccumulator, BATCH_AXIS};
pub use batch::{Batch, Example, KeyedExamples};
pub use models::{Architecture, BigramConfig, FixtureConfig, Model, ModelError};
pub use optimizer::{apply_updates, Optimizer, OptimizerError, OptimizerState};
pub use param_tree::{ParamTree, TreeError};
pub use pretrained::{load_pretrained, PretrainedLoadError};
pub use safetensor_utils::{read_safetensors, write_safetensors, SafetensorIoError};
pub use tensor::{NamedTensor, TensorError};
pub use tokenizer::{StaticTokenizer, Tokenizer};
