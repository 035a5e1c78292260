pub mod arch;
pub mod batch;
pub mod error;
pub mod optimization;
pub mod params;
pub mod penalty;
pub mod schedule;
mod weights;

pub use batch::{Batch, IGNORE_INDEX, SEQ_MULTIPLE};
pub use error::{MlErr, Result};
pub use params::{ParamLayout, ParamStore, TensorMeta};
pub use penalty::{NormPenalty, PenaltyOutput};
