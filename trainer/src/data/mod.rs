pub mod dataloader;
pub mod dataset;
pub mod shard;
pub mod stream;

pub use dataloader::DataLoader;
pub use dataset::{Example, LoadOptions, TokenizedDataset};
pub use shard::{ShardSpec, shard_range};
pub use stream::{BatchStream, Fetch};
