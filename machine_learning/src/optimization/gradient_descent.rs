use rayon::prelude::*;

use super::{Optimizer, check_sizes};
use crate::error::{MlErr, Result};

/// Gradient descent with optional momentum and L2 weight decay.
#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
    steps: usize,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - How much of the previous step carries over, 0 disables it.
    /// * `weight_decay` - The L2 coefficient added to the gradient.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
            steps: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_sizes(params, grad)?;
        if self.velocity.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                a: "params",
                b: "optimizer state",
                got: params.len(),
                expected: self.velocity.len(),
            });
        }

        let Self {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        params
            .par_iter_mut()
            .zip(grad)
            .zip(self.velocity.par_iter_mut())
            .for_each(|((p, &g), v)| {
                let g = g + wd * *p;

                if mu == 0. {
                    *p -= lr * g;
                    return;
                }

                *v = mu * *v + g;
                *p -= lr * *v;
            });

        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn steps(&self) -> usize {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_step_follows_the_gradient() {
        let mut sgd = GradientDescent::new(2, 0.25, 0., 0.);
        let mut params = [1., -1.];

        sgd.update_params(&mut params, &[2., -4.]).unwrap();

        assert_eq!(params, [0.5, 0.]);
        assert_eq!(sgd.steps(), 1);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut sgd = GradientDescent::new(1, 1., 0.5, 0.);
        let mut params = [0.];

        sgd.update_params(&mut params, &[1.]).unwrap();
        sgd.update_params(&mut params, &[1.]).unwrap();

        // velocities are 1 and 1.5
        assert_eq!(params, [-2.5]);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut sgd = GradientDescent::new(1, 0.5, 0., 0.1);
        let mut params = [2.];

        sgd.update_params(&mut params, &[0.]).unwrap();

        assert!((params[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let mut sgd = GradientDescent::new(2, 0.1, 0., 0.);

        assert!(sgd.update_params(&mut [0.; 2], &[0.; 3]).is_err());
        assert!(sgd.update_params(&mut [0.; 3], &[0.; 3]).is_err());
        assert_eq!(sgd.steps(), 0);
    }
}
