use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use machine_learning::arch::{CausalModel, ModelOutput};

use crate::{
    config::TrainingConfig, data::DataLoader, dist::ExecutionContext, error::Result,
    report::StatRecord,
};

/// Runs before the training sub-steps of every outer step.
#[async_trait]
pub trait Evaluator<M: CausalModel + Send>: Send {
    /// # Arguments
    /// * `model` - The model being trained, without any penalty.
    /// * `step` - The outer step about to be trained.
    /// * `ctx` - The worker's execution context.
    /// * `start` - When training started.
    /// * `val_loader` - This worker's validation shard, if any.
    /// * `config` - The run's configuration.
    async fn evaluate(
        &mut self,
        model: &mut M,
        step: usize,
        ctx: &mut ExecutionContext,
        start: Instant,
        val_loader: Option<&mut DataLoader>,
        config: &TrainingConfig,
    ) -> Result<()>;
}

/// Reports the mean validation loss every `eval_steps` outer steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationEvaluator {
    eval_steps: usize,
    eval_batches: usize,
}

impl ValidationEvaluator {
    /// Creates a new `ValidationEvaluator`.
    ///
    /// # Arguments
    /// * `eval_steps` - Validate when the step is a multiple of it, never when 0.
    /// * `eval_batches` - At most this many batches per worker, all when 0.
    pub fn new(eval_steps: usize, eval_batches: usize) -> Self {
        Self {
            eval_steps,
            eval_batches,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.eval_steps, config.eval_batches)
    }

    pub fn is_due(&self, step: usize) -> bool {
        self.eval_steps != 0 && step % self.eval_steps == 0
    }

    /// Sums the per batch task loss over this worker's shard.
    fn local_loss<M: CausalModel>(&self, model: &M, loader: &mut DataLoader) -> Result<(f32, f32)> {
        let limit = match self.eval_batches {
            0 => usize::MAX,
            n => n,
        };

        loader.reset();
        let (mut sum, mut count) = (0., 0usize);

        while count < limit {
            let Some(batch) = loader.next_batch()? else {
                break;
            };

            sum += model.forward(&batch)?.loss();
            count += 1;
        }

        Ok((sum, count as f32))
    }
}

#[async_trait]
impl<M: CausalModel + Send> Evaluator<M> for ValidationEvaluator {
    async fn evaluate(
        &mut self,
        model: &mut M,
        step: usize,
        ctx: &mut ExecutionContext,
        start: Instant,
        val_loader: Option<&mut DataLoader>,
        _config: &TrainingConfig,
    ) -> Result<()> {
        let Some(loader) = val_loader else {
            return Ok(());
        };

        if !self.is_due(step) {
            return Ok(());
        }

        model.set_training(false);
        let (sum, count) = self.local_loss(&*model, loader)?;

        let all = ctx.gather(&[sum, count]).await?;
        let (sum, count) = all
            .chunks_exact(2)
            .fold((0., 0.), |(s, c), pair| (s + pair[0], c + pair[1]));

        if count == 0. {
            debug!(step = step; "no validation batches");
            return Ok(());
        }

        let record = StatRecord::new()
            .with("val_loss", sum / count)
            .with("step", step as f64)
            .with("time", start.elapsed().as_secs_f64());

        ctx.report(&record, &format!("Validation at i = {step},"), "", true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_runs_every_eval_steps() {
        let evaluator = ValidationEvaluator::new(3, 0);
        let due: Vec<_> = (0..7).filter(|&s| evaluator.is_due(s)).collect();

        assert_eq!(due, [0, 3, 6]);
        assert!(!ValidationEvaluator::new(0, 0).is_due(0));
    }
}
