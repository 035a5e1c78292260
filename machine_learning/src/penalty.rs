use std::path::Path;

use crate::{
    Batch, ParamStore,
    arch::{CausalModel, ModelOutput},
    error::Result,
};

/// The outputs of a forward pass with the penalty term split out.
#[derive(Debug)]
pub struct PenaltyOutput<O> {
    /// The task loss of the wrapped model alone.
    pub activation_loss: f32,
    /// `lambda` times the squared norm of the penalized parameters.
    pub penalty: f32,
    /// The wrapped model's full outputs.
    pub outputs: O,
}

impl<O> PenaltyOutput<O> {
    /// Wraps outputs that carry no penalty.
    pub fn unpenalized(outputs: O) -> Self
    where
        O: ModelOutput,
    {
        Self {
            activation_loss: outputs.loss(),
            penalty: 0.,
            outputs,
        }
    }

    /// The objective that is actually minimized.
    pub fn total(&self) -> f32 {
        self.activation_loss + self.penalty
    }
}

/// Adds an L2 penalty over a model's parameters to its task loss.
///
/// With a base snapshot the penalty measures the distance to it instead,
/// `lambda * sum ||p - p_base||²`. Only tensors with a non-zero leading
/// dimension are penalized.
#[derive(Debug, Clone)]
pub struct NormPenalty<M> {
    target: M,
    base: Option<Vec<f32>>,
    lambda: f32,
}

impl<M: CausalModel> NormPenalty<M> {
    /// Penalizes the plain norm of `target`'s parameters.
    pub fn new(target: M, lambda: f32) -> Self {
        Self {
            target,
            base: None,
            lambda,
        }
    }

    /// Penalizes the distance of `target`'s parameters to `base`.
    ///
    /// # Arguments
    /// * `target` - The model being trained.
    /// * `base` - A frozen copy of the initial parameters, must share `target`'s layout.
    /// * `lambda` - The penalty coefficient.
    ///
    /// # Returns
    /// The wrapped model or a layout mismatch error.
    pub fn with_base(target: M, base: &ParamStore, lambda: f32) -> Result<Self> {
        target.store().layout().ensure_matches(base.layout())?;

        Ok(Self {
            target,
            base: Some(base.params().to_vec()),
            lambda,
        })
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    pub fn target(&self) -> &M {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut M {
        &mut self.target
    }

    /// Whether the penalty is measured against a base snapshot.
    pub fn is_diff(&self) -> bool {
        self.base.is_some()
    }

    /// Gives back the wrapped model, dropping any base snapshot.
    pub fn into_inner(self) -> M {
        self.target
    }

    fn penalty_f64(&self) -> f64 {
        let store = self.target.store();
        let params = store.params();
        let mut sum = 0f64;

        for meta in store.layout().iter().filter(|m| m.is_penalized()) {
            let range = meta.range();

            sum += match &self.base {
                Some(base) => params[range.clone()]
                    .iter()
                    .zip(&base[range])
                    .map(|(&p, &b)| f64::from(p - b).powi(2))
                    .sum::<f64>(),
                None => params[range].iter().map(|&p| f64::from(p).powi(2)).sum(),
            };
        }

        f64::from(self.lambda) * sum
    }

    /// The current value of the penalty term.
    pub fn penalty(&self) -> f32 {
        self.penalty_f64() as f32
    }

    /// Runs the wrapped model and evaluates the penalty.
    pub fn forward(&self, batch: &Batch) -> Result<PenaltyOutput<M::Output>> {
        let outputs = self.target.forward(batch)?;

        Ok(PenaltyOutput {
            activation_loss: outputs.loss(),
            penalty: self.penalty(),
            outputs,
        })
    }

    /// Accumulates the gradient of `scale * (activation_loss + penalty)`.
    pub fn backward(
        &mut self,
        batch: &Batch,
        output: &PenaltyOutput<M::Output>,
        scale: f32,
    ) -> Result<()> {
        self.target.backward(batch, &output.outputs, scale)?;
        self.add_penalty_grad(scale);
        Ok(())
    }

    fn add_penalty_grad(&mut self, scale: f32) {
        let coef = 2. * self.lambda * scale;
        let Self { target, base, .. } = self;

        let store = target.store_mut();
        let ranges: Vec<_> = store
            .layout()
            .iter()
            .filter(|m| m.is_penalized())
            .map(|m| m.range())
            .collect();

        let (grads, params) = store.grads_with_params();
        for range in ranges {
            let grads = &mut grads[range.clone()];
            let params = &params[range.clone()];

            match base {
                Some(base) => {
                    for ((g, &p), &b) in grads.iter_mut().zip(params).zip(&base[range]) {
                        *g += coef * (p - b);
                    }
                }
                None => {
                    for (g, &p) in grads.iter_mut().zip(params) {
                        *g += coef * p;
                    }
                }
            }
        }
    }

    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        self.target.save_pretrained(dir)
    }
}
