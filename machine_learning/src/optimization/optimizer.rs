use crate::error::Result;

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer: Send {
    /// Updates the provided slice of parameters using the accumulated gradients.
    ///
    /// # Arguments
    /// * `params` - The parameters to update.
    /// * `grad` - The gradient of the loss with respect to `params`.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`, or
    /// with the state the optimizer was built for.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    /// The learning rate the next update will use.
    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);

    /// The amount of updates applied so far.
    fn steps(&self) -> usize;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        (**self).update_params(params, grad)
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        (**self).set_learning_rate(learning_rate);
    }

    fn steps(&self) -> usize {
        (**self).steps()
    }
}
