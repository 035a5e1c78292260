use rayon::prelude::*;

use super::{Optimizer, check_sizes};
use crate::error::{MlErr, Result};

/// Adam, with either coupled (L2) or decoupled (AdamW) weight decay.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    weight_decay: f32,
    decoupled: bool,
    m: Box<[f32]>,
    v: Box<[f32]>,
    steps: usize,
}

impl Adam {
    /// Creates a new `Adam` optimizer whose weight decay is added to the gradient.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `betas` - The decay rates of the first and second moment estimates.
    /// * `epsilon` - Added to the denominator for numerical stability.
    /// * `weight_decay` - The L2 coefficient.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(
        len: usize,
        learning_rate: f32,
        betas: (f32, f32),
        epsilon: f32,
        weight_decay: f32,
    ) -> Self {
        Self {
            learning_rate,
            beta1: betas.0,
            beta2: betas.1,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            weight_decay,
            decoupled: false,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            steps: 0,
        }
    }

    /// Same as `new` but decaying the parameters directly, as AdamW does.
    pub fn decoupled(
        len: usize,
        learning_rate: f32,
        betas: (f32, f32),
        epsilon: f32,
        weight_decay: f32,
    ) -> Self {
        Self {
            decoupled: true,
            ..Self::new(len, learning_rate, betas, epsilon, weight_decay)
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_sizes(params, grad)?;
        if self.m.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                a: "params",
                b: "optimizer state",
                got: params.len(),
                expected: self.m.len(),
            });
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            decoupled,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let step_size = lr / (1. - self.beta1_t);
        let bc2_sqrt = (1. - self.beta2_t).sqrt();

        params
            .par_iter_mut()
            .zip(grad)
            .zip(self.m.par_iter_mut())
            .zip(self.v.par_iter_mut())
            .for_each(|(((p, &g), m), v)| {
                let g = if decoupled {
                    *p *= 1. - lr * wd;
                    g
                } else {
                    g + wd * *p
                };

                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() / bc2_sqrt + eps);
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
    fn first_step_moves_by_the_learning_rate() {
        let mut adam = Adam::new(3, 0.01, (0.9, 0.999), 1e-8, 0.);
        let mut params = [1., 1., 1.];

        adam.update_params(&mut params, &[0.5, -3., 0.]).unwrap();

        // bias correction makes the first step exactly lr * sign(g)
        assert!((params[0] - 0.99).abs() < 1e-5);
        assert!((params[1] - 1.01).abs() < 1e-5);
        assert_eq!(params[2], 1.);
    }

    #[test]
    fn decoupled_decay_shrinks_parameters_without_a_gradient() {
        let mut adamw = Adam::decoupled(1, 0.1, (0.9, 0.95), 1e-8, 0.5);
        let mut params = [2.];

        adamw.update_params(&mut params, &[0.]).unwrap();

        assert!((params[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn coupled_decay_goes_through_the_moments() {
        let mut adam = Adam::new(1, 0.1, (0.9, 0.95), 1e-8, 0.5);
        let mut params = [2.];

        adam.update_params(&mut params, &[0.]).unwrap();

        // the decay term becomes the gradient, so the step is a full lr
        assert!((params[0] - 1.9).abs() < 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn learning_rate_can_be_rescheduled() {
        let mut adam = Adam::decoupled(1, 0.1, (0.9, 0.95), 1e-8, 0.);
        adam.set_learning_rate(0.);

        let mut params = [2.];
        adam.update_params(&mut params, &[1.]).unwrap();

        assert_eq!(params, [2.]);
        assert_eq!(adam.learning_rate(), 0.);
    }

    #[test]
    fn state_size_is_checked() {
        let mut adam = Adam::new(2, 0.1, (0.9, 0.95), 1e-8, 0.);
        assert!(adam.update_params(&mut [0.; 4], &[0.; 4]).is_err());
    }
}
