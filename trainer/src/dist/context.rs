use std::{num::NonZeroUsize, ops::Range, sync::Arc};

use log::{info, warn};
use machine_learning::{
    Batch, ParamStore, PenaltyOutput,
    arch::CausalModel,
    optimization::{Optimizer, OptimizerConfig},
};
use rand::rngs::StdRng;
use tokio::net::TcpListener;

use super::{
    Precision, Role, WorldInfo, bootstrap,
    collective::{Link, round_to_bf16},
};
use crate::{
    data::{DataLoader, ShardSpec, TokenizedDataset},
    error::Result,
    objective::Objective,
    report::{Reporter, StatRecord},
};

/// A worker's view of the distributed run.
///
/// Owns the connections to the other workers and the reporter, and knows
/// which part of the parameters this worker updates.
pub struct ExecutionContext {
    world: WorldInfo,
    precision: Precision,
    link: Link,
    reporter: Reporter,
    /// Every worker's parameter shard, indexed by rank. Filled by `prepare`.
    shards: Vec<Range<usize>>,
}

impl ExecutionContext {
    /// Creates a new `ExecutionContext` over an already wired link.
    ///
    /// # Arguments
    /// * `world` - This worker's place in the world.
    /// * `precision` - How parameters are stored and updated.
    /// * `link` - The connections to the other workers.
    /// * `reporter` - Where progress goes.
    pub fn new(world: WorldInfo, precision: Precision, link: Link, reporter: Reporter) -> Self {
        Self {
            world,
            precision,
            link,
            reporter,
            shards: Vec::new(),
        }
    }

    /// A world of one.
    pub fn local(precision: Precision, reporter: Reporter) -> Self {
        Self::new(WorldInfo::single(), precision, Link::Local, reporter)
    }

    /// Joins the world described by `world` over TCP.
    ///
    /// The primary listens on the master address until every replica joined,
    /// replicas connect to it.
    pub async fn connect(world: WorldInfo, precision: Precision, reporter: Reporter) -> Result<Self> {
        let link = if world.world_size == 1 {
            Link::Local
        } else if world.role().is_primary() {
            let listener = TcpListener::bind(world.master()).await?;
            info!(world_size = world.world_size; "waiting for workers at {}", world.master());
            Link::hub(bootstrap::accept_replicas(&listener, world.world_size).await?)
        } else {
            Link::spoke(bootstrap::connect_to_primary(&world).await?)
        };

        Ok(Self::new(world, precision, link, reporter))
    }

    pub fn role(&self) -> Role {
        self.world.role()
    }

    pub fn rank(&self) -> usize {
        self.world.rank
    }

    pub fn world_size(&self) -> usize {
        self.world.world_size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The parameters this worker updates.
    pub fn own_shard(&self) -> Range<usize> {
        self.shards.get(self.rank()).cloned().unwrap_or_default()
    }

    /// Makes every worker start from the primary's parameters.
    ///
    /// # Arguments
    /// * `store` - The model's parameters, overwritten on replicas.
    /// * `optimizer` - The optimizer to build.
    ///
    /// # Returns
    /// An optimizer over the parameters this worker updates.
    pub async fn prepare(
        &mut self,
        store: &mut ParamStore,
        optimizer: &OptimizerConfig,
    ) -> Result<Box<dyn Optimizer>> {
        self.link.broadcast(store.params_mut()).await?;

        let total = store.len();
        let world_size = self.world_size();

        self.shards = match self.precision {
            Precision::Bf16 => {
                round_to_bf16(store.params_mut());
                vec![0..total; world_size]
            }
            Precision::Fp32Sharded => {
                let num_workers = NonZeroUsize::new(world_size).unwrap_or(NonZeroUsize::MIN);
                ShardSpec::all_ranges(total, num_workers)
            }
        };

        let own = self.own_shard();
        info!(
            rank = self.rank(),
            params = total,
            updated = own.len();
            "prepared {:?} training with {}",
            self.precision,
            optimizer.kind
        );

        Ok(optimizer.build(own.len()))
    }

    /// This worker's part of `dataset`.
    ///
    /// # Arguments
    /// * `dataset` - The full dataset.
    /// * `batch_size` - The examples per batch.
    /// * `pad_token_id` - The token used for padding.
    /// * `rng` - Shuffles the shard on every pass when given.
    pub fn shard_loader(
        &self,
        dataset: Arc<TokenizedDataset>,
        batch_size: usize,
        pad_token_id: u32,
        rng: Option<StdRng>,
    ) -> DataLoader {
        let num_workers = NonZeroUsize::new(self.world_size()).unwrap_or(NonZeroUsize::MIN);
        let shard = ShardSpec::new(self.rank(), num_workers);
        let loader = DataLoader::new(dataset, shard, batch_size, pad_token_id);

        match rng {
            Some(rng) => loader.shuffled(rng),
            None => loader,
        }
    }

    /// Runs the local backward pass.
    ///
    /// # Arguments
    /// * `objective` - The objective `out` was computed with.
    /// * `batch` - The batch `out` was computed on.
    /// * `out` - The forward outputs.
    /// * `scale` - The factor applied to the gradient.
    /// * `sync` - Average the gradient buffer over the world afterwards.
    pub async fn backward<M: CausalModel>(
        &mut self,
        objective: &mut Objective<M>,
        batch: &Batch,
        out: &PenaltyOutput<M::Output>,
        scale: f32,
        sync: bool,
    ) -> Result<()> {
        objective.backward(batch, out, scale)?;

        if sync {
            let grads = objective.store_mut().grads_mut();
            self.link.all_reduce_mean(grads, self.precision).await?;
        }

        Ok(())
    }

    /// Applies exactly one optimizer update.
    ///
    /// In bf16 mode every worker updates everything and rounds the result, in
    /// sharded mode each worker updates its shard and the shards are gathered.
    pub async fn optimizer_step(
        &mut self,
        store: &mut ParamStore,
        optimizer: &mut dyn Optimizer,
    ) -> Result<()> {
        let own = self.own_shard();
        let (params, grads) = store.split_mut();
        optimizer.update_params(&mut params[own.clone()], &grads[own])?;

        match self.precision {
            Precision::Bf16 => round_to_bf16(params),
            Precision::Fp32Sharded => {
                let rank = self.rank();
                self.link
                    .all_gather_shards(params, &self.shards, rank)
                    .await?;
            }
        }

        Ok(())
    }

    pub fn zero_grad(&self, store: &mut ParamStore) {
        store.zero_grad();
    }

    /// Every worker's `values`, concatenated in rank order.
    pub async fn gather(&mut self, values: &[f32]) -> Result<Vec<f32>> {
        self.link.gather(values).await
    }

    pub async fn wait_for_everyone(&mut self) -> Result<()> {
        self.link.barrier().await
    }

    /// See `Reporter::report`.
    pub fn report(
        &mut self,
        record: &StatRecord,
        prefix: &str,
        suffix: &str,
        to_tracker: bool,
    ) -> Result<Option<String>> {
        self.reporter.report(record, prefix, suffix, to_tracker)
    }

    pub fn print(&self, msg: &str) {
        self.reporter.print(msg);
    }

    pub fn reporter_mut(&mut self) -> &mut Reporter {
        &mut self.reporter
    }

    /// Gives up on the run: the other workers are told and the tracker closed.
    pub async fn abort(&mut self, reason: &str) {
        self.link.abort(reason).await;

        if let Err(e) = self.reporter.finish() {
            warn!("couldn't close the tracker: {e}");
        }
    }

    /// Leaves the world and closes the tracker.
    pub async fn shutdown(&mut self) -> Result<()> {
        let left = self.link.shutdown().await;
        let closed = self.reporter.finish();
        left?;
        closed
    }
}
