use std::{fs, path::Path};

use log::debug;
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::{CausalModel, ModelOutput, loss};
use crate::{
    Batch, IGNORE_INDEX, ParamLayout, ParamStore,
    error::{MlErr, Result},
    weights,
};

const EMBED: &str = "embed.weight";
const PROJ_W: &str = "proj.weight";
const PROJ_B: &str = "proj.bias";
const HEAD_W: &str = "lm_head.weight";
const HEAD_B: &str = "lm_head.bias";

const INIT_STD: f32 = 0.02;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// The hyperparameters of a `CausalLm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
}

impl LmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 {
            return Err(MlErr::InvalidConfig(format!(
                "vocab_size ({}) and hidden_size ({}) must be positive",
                self.vocab_size, self.hidden_size
            )));
        }

        Ok(())
    }

    /// The tensors a model with this configuration is made of.
    pub fn layout(&self) -> Result<ParamLayout> {
        let Self {
            vocab_size: v,
            hidden_size: h,
        } = *self;

        ParamLayout::new()
            .push(EMBED, &[v, h])?
            .push(PROJ_W, &[h, h])?
            .push(PROJ_B, &[h])?
            .push(HEAD_W, &[h, v])?
            .push(HEAD_B, &[v])
    }
}

/// A small causal language model.
///
/// Each position embeds its token, goes through a `tanh` projection and is
/// mapped back onto the vocabulary to predict the following token.
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: LmConfig,
    store: ParamStore,
    training: bool,
}

/// What `CausalLm::forward` leaves behind for the backward pass.
#[derive(Debug)]
pub struct LmOutput {
    loss: f32,
    logits: Array2<f32>,
    embedded: Array2<f32>,
    hidden: Array2<f32>,
    targets: Vec<Option<usize>>,
    count: usize,
}

impl LmOutput {
    /// The vocabulary scores, one row per batch position.
    pub fn logits(&self) -> ArrayView2<'_, f32> {
        self.logits.view()
    }

    /// How many positions took part in the loss.
    pub fn num_targets(&self) -> usize {
        self.count
    }
}

impl ModelOutput for LmOutput {
    fn loss(&self) -> f32 {
        self.loss
    }
}

impl CausalLm {
    /// Creates a freshly initialized model.
    ///
    /// Matrices are drawn from `N(0, 0.02)` and biases start at zero.
    ///
    /// # Arguments
    /// * `config` - The model's hyperparameters.
    /// * `rng` - The source of randomness for the initial weights.
    pub fn init<R: Rng + ?Sized>(config: LmConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let mut store = ParamStore::zeros(config.layout()?);
        let normal = Normal::new(0., INIT_STD)
            .map_err(|e| MlErr::InvalidConfig(format!("bad init distribution: {e}")))?;

        let ranges: Vec<_> = store
            .layout()
            .iter()
            .filter(|meta| meta.shape.len() == 2)
            .map(|meta| meta.range())
            .collect();

        let params = store.params_mut();
        for range in ranges {
            params[range]
                .iter_mut()
                .for_each(|p| *p = normal.sample(rng));
        }

        Self::from_store(config, store)
    }

    /// Wraps already materialized parameters.
    pub fn from_store(config: LmConfig, store: ParamStore) -> Result<Self> {
        config.validate()?;
        config.layout()?.ensure_matches(store.layout())?;

        Ok(Self {
            config,
            store,
            training: true,
        })
    }

    /// Loads a model previously written by `save_pretrained`.
    ///
    /// # Arguments
    /// * `dir` - A directory holding `config.json` and `model.safetensors`.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let config: LmConfig = serde_json::from_slice(&fs::read(dir.join(CONFIG_FILE))?)?;
        config.validate()?;

        let store = weights::load(config.layout()?, &dir.join(WEIGHTS_FILE))?;
        debug!(params = store.len(); "loaded pretrained model from {}", dir.display());

        Self::from_store(config, store)
    }

    pub fn config(&self) -> LmConfig {
        self.config
    }

    fn embed(&self, batch: &Batch) -> Result<Array2<f32>> {
        let vocab_size = self.config.vocab_size;
        let table = self.store.view2(EMBED)?;
        let rows = batch.batch_size() * batch.seq_len();
        let mut embedded = Array2::zeros((rows, self.config.hidden_size));

        for (mut row, &token) in embedded.rows_mut().into_iter().zip(batch.input_ids()) {
            let token = token as usize;
            if token >= vocab_size {
                return Err(MlErr::TokenOutOfRange {
                    what: "input",
                    token: token as i64,
                    vocab_size,
                });
            }

            row.assign(&table.row(token));
        }

        Ok(embedded)
    }

    /// Position `t` predicts the label at `t + 1`, unless it's ignored or padded.
    fn targets(&self, batch: &Batch) -> Result<Vec<Option<usize>>> {
        let vocab_size = self.config.vocab_size;
        let (rows, seq) = batch.labels().dim();
        let mut targets = Vec::with_capacity(rows * seq);

        for (labels, mask) in batch
            .labels()
            .rows()
            .into_iter()
            .zip(batch.attention_mask().rows())
        {
            for t in 0..seq {
                if t + 1 == seq {
                    targets.push(None);
                    continue;
                }

                let label = labels[t + 1];
                if label == IGNORE_INDEX || mask[t + 1] == 0 {
                    targets.push(None);
                    continue;
                }

                if label < 0 || label as usize >= vocab_size {
                    return Err(MlErr::TokenOutOfRange {
                        what: "label",
                        token: label,
                        vocab_size,
                    });
                }

                targets.push(Some(label as usize));
            }
        }

        Ok(targets)
    }
}

impl CausalModel for CausalLm {
    type Output = LmOutput;

    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }

    fn forward(&self, batch: &Batch) -> Result<LmOutput> {
        let embedded = self.embed(batch)?;

        let mut hidden = embedded.dot(&self.store.view2(PROJ_W)?);
        hidden += &self.store.view1(PROJ_B)?;
        hidden.mapv_inplace(f32::tanh);

        let mut logits = hidden.dot(&self.store.view2(HEAD_W)?);
        logits += &self.store.view1(HEAD_B)?;

        let targets = self.targets(batch)?;
        let (loss, count) = loss::cross_entropy(logits.view(), &targets);

        Ok(LmOutput {
            loss,
            logits,
            embedded,
            hidden,
            targets,
            count,
        })
    }

    fn backward(&mut self, batch: &Batch, output: &LmOutput, scale: f32) -> Result<()> {
        let rows = batch.batch_size() * batch.seq_len();
        if output.targets.len() != rows {
            return Err(MlErr::SizeMismatch {
                a: "output",
                b: "batch",
                got: output.targets.len(),
                expected: rows,
            });
        }

        if output.count == 0 {
            return Ok(());
        }

        let d_logits = loss::cross_entropy_grad(
            output.logits.view(),
            &output.targets,
            scale / output.count as f32,
        );

        let d_head_w = output.hidden.t().dot(&d_logits);
        let d_head_b = d_logits.sum_axis(Axis(0));

        let mut d_z = d_logits.dot(&self.store.view2(HEAD_W)?.t());
        d_z.zip_mut_with(&output.hidden, |d, &h| *d *= 1. - h * h);

        let d_proj_w = output.embedded.t().dot(&d_z);
        let d_proj_b = d_z.sum_axis(Axis(0));
        let d_x = d_z.dot(&self.store.view2(PROJ_W)?.t());

        let mut d_embed = Array2::zeros((self.config.vocab_size, self.config.hidden_size));
        for (row, &token) in d_x.rows().into_iter().zip(batch.input_ids()) {
            let mut slot = d_embed.row_mut(token as usize);
            slot += &row;
        }

        let store = &mut self.store;
        store.accumulate_grad(EMBED, d_embed.view())?;
        store.accumulate_grad(PROJ_W, d_proj_w.view())?;
        store.accumulate_grad(PROJ_B, d_proj_b.view())?;
        store.accumulate_grad(HEAD_W, d_head_w.view())?;
        store.accumulate_grad(HEAD_B, d_head_b.view())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        let config = serde_json::to_vec_pretty(&self.config)?;
        fs::write(dir.join(CONFIG_FILE), config)?;
        weights::save(&self.store, &dir.join(WEIGHTS_FILE))
    }
}
