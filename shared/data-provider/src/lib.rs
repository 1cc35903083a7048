mod cycle;
mod memory;
mod mixture;
mod synthetic;
mod traits;

pub use cycle::Cycle;
pub use memory::InMemoryDataProvider;
pub use mixture::MixtureProvider;
pub use synthetic::SyntheticTokenProvider;
pub use traits::{DataProvider, DataProviderError, Shuffle, TokenizedData};
