use machine_learning::{
    Batch, NormPenalty, ParamStore, PenaltyOutput,
    arch::CausalModel,
};

use crate::error::Result;

/// The function the controller minimizes: the task loss, plus the norm
/// penalty when one is configured.
#[derive(Debug)]
pub enum Objective<M: CausalModel> {
    Plain(M),
    Penalized(NormPenalty<M>),
}

impl<M: CausalModel> Objective<M> {
    /// Wraps `model` according to the penalty options.
    ///
    /// # Arguments
    /// * `model` - The model to train, with the parameters it starts from.
    /// * `norm` - The penalty coefficient, no penalty when `None`.
    /// * `diff_norm` - Penalize the drift from the starting parameters instead
    ///                 of their magnitude.
    pub fn new(model: M, norm: Option<f32>, diff_norm: bool) -> Result<Self> {
        let objective = match norm {
            None => Objective::Plain(model),
            Some(lambda) if diff_norm => {
                let base = model.store().clone();
                Objective::Penalized(NormPenalty::with_base(model, &base, lambda)?)
            }
            Some(lambda) => Objective::Penalized(NormPenalty::new(model, lambda)),
        };

        Ok(objective)
    }

    pub fn is_penalized(&self) -> bool {
        matches!(self, Objective::Penalized(_))
    }

    pub fn model(&self) -> &M {
        match self {
            Objective::Plain(model) => model,
            Objective::Penalized(penalty) => penalty.target(),
        }
    }

    pub fn model_mut(&mut self) -> &mut M {
        match self {
            Objective::Plain(model) => model,
            Objective::Penalized(penalty) => penalty.target_mut(),
        }
    }

    pub fn store(&self) -> &ParamStore {
        self.model().store()
    }

    pub fn store_mut(&mut self) -> &mut ParamStore {
        self.model_mut().store_mut()
    }

    pub fn forward(&self, batch: &Batch) -> Result<PenaltyOutput<M::Output>> {
        let out = match self {
            Objective::Plain(model) => PenaltyOutput::unpenalized(model.forward(batch)?),
            Objective::Penalized(penalty) => penalty.forward(batch)?,
        };

        Ok(out)
    }

    /// Accumulates the gradient of `scale` times the objective.
    pub fn backward(
        &mut self,
        batch: &Batch,
        out: &PenaltyOutput<M::Output>,
        scale: f32,
    ) -> Result<()> {
        match self {
            Objective::Plain(model) => model.backward(batch, &out.outputs, scale)?,
            Objective::Penalized(penalty) => penalty.backward(batch, out, scale)?,
        }

        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        self.model_mut().set_training(training);
    }

    /// Drops the penalty, giving back the model alone.
    pub fn into_inner(self) -> M {
        match self {
            Objective::Plain(model) => model,
            Objective::Penalized(penalty) => penalty.into_inner(),
        }
    }
}
