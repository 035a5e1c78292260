use std::path::Path;

use crate::{Batch, ParamStore, error::Result};

/// The result of a forward pass that carries a task loss.
pub trait ModelOutput {
    fn loss(&self) -> f32;
}

pub trait CausalModel {
    type Output: ModelOutput;

    /// The model's parameters and accumulated gradients.
    fn store(&self) -> &ParamStore;

    fn store_mut(&mut self) -> &mut ParamStore;

    /// Runs the model over `batch`, computing the next token prediction loss.
    ///
    /// # Arguments
    /// * `batch` - The batch of token sequences.
    ///
    /// # Returns
    /// The forward outputs, including everything `backward` needs.
    fn forward(&self, batch: &Batch) -> Result<Self::Output>;

    /// Accumulates `scale * dloss/dparams` into the gradient buffer.
    ///
    /// # Arguments
    /// * `batch` - The same batch given to `forward`.
    /// * `output` - The outputs `forward` produced for `batch`.
    /// * `scale` - The factor applied to the gradient before accumulating it.
    fn backward(&mut self, batch: &Batch, output: &Self::Output, scale: f32) -> Result<()>;

    /// Switches between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Writes the weights and configuration to `dir`, which must exist.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}
