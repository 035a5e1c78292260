use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use log::info;
use machine_learning::arch::CausalLm;

use crate::{
    checkpoint::CheckpointManager,
    config::{ConfigErr, TrainingConfig},
    controller::Controller,
    data::TokenizedDataset,
    determinism::RngSources,
    dist::{ExecutionContext, Role, WorldInfo},
    error::Result,
    eval::ValidationEvaluator,
    metrics::TrainSummary,
    report::{JsonlTracker, Reporter, Tracker},
};

/// Trains as the worker the environment describes.
///
/// # Arguments
/// * `config` - The run's configuration.
///
/// # Returns
/// What the run went through, or the first error any worker hit.
pub async fn train(config: &TrainingConfig) -> Result<TrainSummary> {
    config.validate()?;

    let world = WorldInfo::from_env()?;
    let reporter = Reporter::new(world.role(), tracker(config, world.role())?);
    let ctx = ExecutionContext::connect(world, config.precision(), reporter).await?;

    train_with(config, ctx).await
}

/// Trains as one worker of an already connected world.
pub async fn train_with(config: &TrainingConfig, mut ctx: ExecutionContext) -> Result<TrainSummary> {
    let controller = match build(config, &mut ctx).await {
        Ok(controller) => controller,
        Err(e) => {
            ctx.abort(&e.to_string()).await;
            return Err(e);
        }
    };

    let checkpoint = CheckpointManager::from_config(config);
    let (_, summary) = controller.run(&mut ctx, checkpoint.as_ref()).await?;
    ctx.shutdown().await?;

    info!(
        rank = ctx.rank(),
        steps = summary.steps,
        updates = summary.optimizer_updates,
        restarts = summary.epoch_restarts;
        "worker done"
    );
    Ok(summary)
}

async fn build(
    config: &TrainingConfig,
    ctx: &mut ExecutionContext,
) -> Result<Controller<CausalLm, ValidationEvaluator>> {
    let RngSources { mut init, data } = config.determinism().sources();

    let train_set = TokenizedDataset::from_jsonl(&config.train_data, &config.train_load_options())?;
    let train_loader = ctx.shard_loader(
        Arc::new(train_set),
        config.micro_batch_size,
        config.pad_token_id,
        Some(data),
    );

    let val_loader = match &config.val_data {
        Some(path) => {
            let val_set = TokenizedDataset::from_jsonl(path, &config.val_load_options())?;
            Some(ctx.shard_loader(
                Arc::new(val_set),
                config.val_batch_size,
                config.pad_token_id,
                None,
            ))
        }
        None => None,
    };

    let model = match (&config.model_path, config.model_init) {
        (Some(path), _) => CausalLm::from_pretrained(path)?,
        (None, Some(model_init)) => CausalLm::init(model_init, &mut init)?,
        (None, None) => {
            return Err(ConfigErr::Invalid("no model to train".to_string()).into());
        }
    };

    let evaluator = ValidationEvaluator::from_config(config);
    Controller::init(model, ctx, config, train_loader, val_loader, evaluator).await
}

/// The primary's experiment tracker, when tracking is enabled.
fn tracker(config: &TrainingConfig, role: Role) -> Result<Option<Box<dyn Tracker>>> {
    if !config.use_wandb || !role.is_primary() {
        return Ok(None);
    }

    let run_name = match &config.wandb_run_name {
        Some(name) => name.clone(),
        None => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            format!("run-{secs}")
        }
    };

    let tracker = JsonlTracker::create(&config.tracker_dir, &config.wandb_project, &run_name)?;
    Ok(Some(Box::new(tracker)))
}
