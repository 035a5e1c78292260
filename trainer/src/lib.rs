pub mod accumulation;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod data;
pub mod determinism;
pub mod dist;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod objective;
pub mod report;
mod session;

pub use config::{ConfigErr, TrainingConfig};
pub use controller::Controller;
pub use error::{Result, TrainErr};
pub use metrics::TrainSummary;
pub use session::{train, train_with};
