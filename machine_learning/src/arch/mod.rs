mod causal_lm;
pub mod loss;
mod model;

pub use causal_lm::{CausalLm, LmConfig, LmOutput};
pub use model::{CausalModel, ModelOutput};
