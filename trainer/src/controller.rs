use std::time::Instant;

use log::{error, info};
use machine_learning::{
    Batch,
    arch::CausalModel,
    optimization::Optimizer,
    schedule::WarmupCosine,
};

use crate::{
    checkpoint::CheckpointManager,
    config::{TrainPlan, TrainingConfig},
    data::{BatchStream, DataLoader, Fetch},
    dist::ExecutionContext,
    error::{Result, TrainErr},
    eval::Evaluator,
    metrics::{RunningStats, TrainSummary},
    objective::Objective,
    report::StatRecord,
};

/// Drives a training run: validation, accumulated micro-steps and exactly
/// one optimizer update per outer step.
pub struct Controller<M: CausalModel, E> {
    objective: Objective<M>,
    optimizer: Box<dyn Optimizer>,
    schedule: WarmupCosine,
    plan: TrainPlan,
    stream: BatchStream,
    val_loader: Option<DataLoader>,
    evaluator: E,
    config: TrainingConfig,
    stats: RunningStats,
    summary: TrainSummary,
}

impl<M, E> Controller<M, E>
where
    M: CausalModel + Send,
    E: Evaluator<M>,
{
    /// Gets everything ready for the first outer step.
    ///
    /// # Arguments
    /// * `model` - The bare model to train.
    /// * `ctx` - This worker's execution context.
    /// * `config` - The run's configuration.
    /// * `train_loader` - This worker's training shard.
    /// * `val_loader` - This worker's validation shard, if any.
    /// * `evaluator` - Runs before the training sub-steps of every outer step.
    ///
    /// # Returns
    /// The controller, or an error if the world or the configuration don't add up.
    pub async fn init(
        mut model: M,
        ctx: &mut ExecutionContext,
        config: &TrainingConfig,
        train_loader: DataLoader,
        val_loader: Option<DataLoader>,
        evaluator: E,
    ) -> Result<Self> {
        let plan = TrainPlan::resolve(config, train_loader.dataset_len(), ctx.world_size())?;
        let optimizer_config = config.optimizer()?;

        let optimizer = ctx.prepare(model.store_mut(), &optimizer_config).await?;
        let objective = Objective::new(model, config.norm, config.diff_norm)?;
        let schedule =
            WarmupCosine::with_ratio(optimizer_config.lr, config.warmup_ratio, plan.max_steps);

        info!(
            rank = ctx.rank(),
            max_steps = plan.max_steps,
            accumulation = plan.accumulation.steps(),
            warmup = schedule.warmup_steps(),
            penalized = objective.is_penalized();
            "training initialized"
        );

        Ok(Self {
            objective,
            optimizer,
            schedule,
            plan,
            stream: BatchStream::new(train_loader),
            val_loader,
            evaluator,
            config: config.clone(),
            stats: RunningStats::default(),
            summary: TrainSummary::default(),
        })
    }

    pub fn plan(&self) -> TrainPlan {
        self.plan
    }

    pub fn schedule(&self) -> &WarmupCosine {
        &self.schedule
    }

    /// Trains for every planned step and saves the result.
    ///
    /// On failure the other workers are told and the tracker is closed before
    /// the error is returned.
    ///
    /// # Arguments
    /// * `ctx` - This worker's execution context.
    /// * `checkpoint` - Where the trained model goes, nowhere when `None`.
    ///
    /// # Returns
    /// The trained model, without any penalty, and what the run went through.
    pub async fn run(
        mut self,
        ctx: &mut ExecutionContext,
        checkpoint: Option<&CheckpointManager>,
    ) -> Result<(M, TrainSummary)> {
        let start = Instant::now();

        let trained = self.train(ctx, start).await;
        let finished = match trained {
            Ok(()) => self.finalize(ctx, checkpoint, start).await,
            Err(e) => Err(e),
        };

        match finished {
            Ok(done) => Ok(done),
            Err(e) => {
                error!(rank = ctx.rank(); "training failed: {e}");
                ctx.abort(&e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn train(&mut self, ctx: &mut ExecutionContext, start: Instant) -> Result<()> {
        let accumulation = self.plan.accumulation;
        let scale = accumulation.scale();

        for step in 0..self.plan.max_steps {
            let lr = self.schedule.advance();
            self.optimizer.set_learning_rate(lr);

            self.evaluator
                .evaluate(
                    self.objective.model_mut(),
                    step,
                    ctx,
                    start,
                    self.val_loader.as_mut(),
                    &self.config,
                )
                .await?;
            self.objective.set_training(true);

            for micro_step in 0..accumulation.steps() {
                let batch = self.fetch()?;
                let out = self.objective.forward(&batch)?;

                let scaled = [out.activation_loss * scale, out.penalty * scale];
                let (loss, penalty) = world_mean(&ctx.gather(&scaled).await?);
                self.stats.add(loss, penalty);

                let sync = accumulation.is_last(micro_step);
                ctx.backward(&mut self.objective, &batch, &out, scale, sync)
                    .await?;
            }

            ctx.optimizer_step(self.objective.store_mut(), &mut *self.optimizer)
                .await?;
            ctx.zero_grad(self.objective.store_mut());
            self.summary.optimizer_updates += 1;

            let stats = self.stats.take();
            self.summary.bump_step(stats.loss);

            let record = StatRecord::new()
                .with("train_loss", stats.loss)
                .with("train_penalty", stats.penalty)
                .with("step", step as f64)
                .with("time", start.elapsed().as_secs_f64())
                .with("lr", lr);

            ctx.report(&record, &format!("At the beginning of i = {step},"), "", true)?;
        }

        Ok(())
    }

    /// Fetches the next training batch, starting a new pass when the current one is over.
    fn fetch(&mut self) -> Result<Batch> {
        if let Fetch::Batch(batch) = self.stream.fetch()? {
            self.summary.add_batches(1);
            return Ok(batch);
        }

        self.stream.restart();
        self.summary.bump_restart();
        info!(restarts = self.stream.restarts(); "starting a new pass over the training data");

        match self.stream.fetch()? {
            Fetch::Batch(batch) => {
                self.summary.add_batches(1);
                Ok(batch)
            }
            Fetch::EndOfEpoch => Err(TrainErr::EmptyLoader),
        }
    }

    async fn finalize(
        self,
        ctx: &mut ExecutionContext,
        checkpoint: Option<&CheckpointManager>,
        start: Instant,
    ) -> Result<(M, TrainSummary)> {
        let Self {
            objective,
            mut summary,
            ..
        } = self;

        let model = objective.into_inner();
        if let Some(manager) = checkpoint {
            manager.save(ctx.role(), &model)?;
        }

        ctx.wait_for_everyone().await?;
        summary.elapsed = start.elapsed();

        ctx.print(&format!(
            "finished {} steps over {} batches",
            summary.steps, summary.batches
        ));
        Ok((model, summary))
    }
}

/// Averages `[a, b]` pairs gathered from every worker.
fn world_mean(gathered: &[f32]) -> (f32, f32) {
    let workers = (gathered.len() / 2).max(1) as f32;
    let (a, b) = gathered
        .chunks_exact(2)
        .fold((0., 0.), |(a, b), pair| (a + pair[0], b + pair[1]));

    (a / workers, b / workers)
}
