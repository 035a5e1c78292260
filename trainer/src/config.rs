use std::{
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::warn;
use machine_learning::{
    arch::LmConfig,
    optimization::{OptimizerConfig, OptimizerErr},
};
use serde::Deserialize;

use crate::{
    accumulation::Accumulation, data::LoadOptions, determinism::DeterminismConfig,
    dist::Precision,
};

const DEFAULT_MAX_LENGTH: usize = 1024;
const DEFAULT_SEED: u64 = 42;
const DEFAULT_PROJECT: &str = "normtune";
const DEFAULT_TRACKER_DIR: &str = "runs";

/// Problems found while reading or validating the configuration.
#[derive(Debug)]
pub enum ConfigErr {
    Io { path: PathBuf, source: io::Error },
    Parse(serde_json::Error),
    Optimizer(OptimizerErr),
    /// `global_batch_size` isn't split evenly into micro batches over the world.
    Accumulation {
        global: usize,
        micro: usize,
        world: usize,
    },
    Env { var: &'static str, value: String },
    Invalid(String),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErr::Io { path, source } => {
                write!(f, "can't read {}: {source}", path.display())
            }
            ConfigErr::Parse(e) => write!(f, "malformed configuration: {e}"),
            ConfigErr::Optimizer(e) => write!(f, "{e}"),
            ConfigErr::Accumulation {
                global,
                micro,
                world,
            } => write!(
                f,
                "global_batch_size ({global}) must be a positive multiple of \
                 micro_batch_size ({micro}) times the world size ({world})"
            ),
            ConfigErr::Env { var, value } => write!(f, "invalid {var} value {value:?}"),
            ConfigErr::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigErr::Io { source, .. } => Some(source),
            ConfigErr::Parse(e) => Some(e),
            ConfigErr::Optimizer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OptimizerErr> for ConfigErr {
    fn from(value: OptimizerErr) -> Self {
        Self::Optimizer(value)
    }
}

impl From<serde_json::Error> for ConfigErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

fn one() -> usize {
    1
}

fn default_max_length() -> usize {
    DEFAULT_MAX_LENGTH
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

fn default_true() -> bool {
    true
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_tracker_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TRACKER_DIR)
}

/// Every option of a fine-tuning run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    /// A directory written by `save_pretrained` to start from.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Hyperparameters of a freshly initialized model, used without `model_path`.
    #[serde(default)]
    pub model_init: Option<LmConfig>,
    /// A directory whose files are copied next to every checkpoint.
    #[serde(default)]
    pub tokenizer_name: Option<PathBuf>,
    pub train_data: PathBuf,
    #[serde(default)]
    pub val_data: Option<PathBuf>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub response_loss_only: bool,
    #[serde(default)]
    pub pretrain: bool,
    /// Accepted for compatibility, prompts come already formatted.
    #[serde(default)]
    pub sharegpt_format: bool,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "one")]
    pub micro_batch_size: usize,
    #[serde(default)]
    pub global_batch_size: Option<usize>,
    #[serde(default = "one")]
    pub val_batch_size: usize,
    /// Accepted for compatibility, loading happens in process.
    #[serde(default)]
    pub num_dataload_worker: usize,
    #[serde(default = "one")]
    pub epoch: usize,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub warmup_ratio: f64,
    #[serde(default)]
    pub bf16: bool,
    /// The penalty coefficient, no penalty at all when absent.
    #[serde(default)]
    pub norm: Option<f32>,
    #[serde(default)]
    pub diff_norm: bool,
    pub optimizer: String,
    /// Validate every this many steps, never when 0.
    #[serde(default)]
    pub eval_steps: usize,
    /// Upper bound of validation batches per evaluation, unbounded when 0.
    #[serde(default)]
    pub eval_batches: usize,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub use_wandb: bool,
    #[serde(default = "default_project")]
    pub wandb_project: String,
    #[serde(default)]
    pub wandb_run_name: Option<String>,
    #[serde(default = "default_tracker_dir")]
    pub tracker_dir: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub pseudo_random: bool,
}

impl TrainingConfig {
    /// Reads and validates the JSON configuration at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigErr> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigErr::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_json(&raw)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self, ConfigErr> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option that doesn't depend on the world or the dataset.
    pub fn validate(&self) -> Result<(), ConfigErr> {
        let invalid = |msg: &str| Err(ConfigErr::Invalid(msg.to_string()));

        match (&self.model_path, &self.model_init) {
            (None, None) => return invalid("either model_path or model_init is required"),
            (Some(_), Some(_)) => return invalid("model_path and model_init are exclusive"),
            _ => {}
        }

        if self.micro_batch_size == 0 || self.val_batch_size == 0 {
            return invalid("batch sizes must be positive");
        }

        if self.max_length == 0 {
            return invalid("max_length must be positive");
        }

        if self.max_steps.is_none() && self.epoch == 0 {
            return invalid("epoch must be positive when max_steps is not given");
        }

        if !(0. ..=1.).contains(&self.warmup_ratio) {
            return invalid("warmup_ratio must be within [0, 1]");
        }

        if let Some(norm) = self.norm {
            if !norm.is_finite() || norm < 0. {
                return invalid("norm must be a non-negative number");
            }
        } else if self.diff_norm {
            warn!("diff_norm is set without norm, no penalty will be applied");
        }

        if self
            .save_dir
            .as_deref()
            .is_some_and(|dir| dir.file_name().is_none())
        {
            return invalid("save_dir must name a directory, not a root or a relative parent");
        }

        self.optimizer()?;
        Ok(())
    }

    pub fn optimizer(&self) -> Result<OptimizerConfig, ConfigErr> {
        Ok(OptimizerConfig::parse(&self.optimizer)?)
    }

    pub fn precision(&self) -> Precision {
        if self.bf16 {
            Precision::Bf16
        } else {
            Precision::Fp32Sharded
        }
    }

    pub fn determinism(&self) -> DeterminismConfig {
        DeterminismConfig {
            seed: self.seed,
            pseudo_random: self.pseudo_random,
        }
    }

    /// How the training examples are read.
    pub fn train_load_options(&self) -> LoadOptions {
        LoadOptions {
            max_length: self.max_length,
            response_loss_only: self.response_loss_only,
            pretrain: self.pretrain,
        }
    }

    /// Validation examples are never chunked.
    pub fn val_load_options(&self) -> LoadOptions {
        LoadOptions {
            pretrain: false,
            ..self.train_load_options()
        }
    }
}

/// The step budget of a run once the world and the dataset are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainPlan {
    pub max_steps: usize,
    pub accumulation: Accumulation,
}

impl TrainPlan {
    /// Resolves the outer step count and the accumulation factor.
    ///
    /// # Arguments
    /// * `config` - The validated configuration.
    /// * `dataset_len` - The amount of training examples over every worker.
    /// * `world_size` - The amount of workers.
    pub fn resolve(
        config: &TrainingConfig,
        dataset_len: usize,
        world_size: usize,
    ) -> Result<Self, ConfigErr> {
        let accumulation = Accumulation::from_batch_sizes(
            config.global_batch_size,
            config.micro_batch_size,
            world_size,
        )?;

        let global = config
            .global_batch_size
            .unwrap_or(config.micro_batch_size * world_size);

        let max_steps = match config.max_steps {
            Some(steps) => steps,
            None => match dataset_len / global * config.epoch {
                0 => {
                    return Err(ConfigErr::Invalid(format!(
                        "no training steps: {dataset_len} examples can't fill a global batch of {global}"
                    )));
                }
                steps => steps,
            },
        };

        Ok(Self {
            max_steps,
            accumulation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> String {
        r#"{
            "model_init": { "vocab_size": 16, "hidden_size": 4 },
            "train_data": "train.jsonl",
            "optimizer": "type=adamw,lr=1e-3"
        }"#
        .to_string()
    }

    fn with(extra: &str) -> Result<TrainingConfig, ConfigErr> {
        let raw = minimal();
        let raw = format!("{},{extra}}}", raw.trim_end().trim_end_matches('}'));
        TrainingConfig::from_json(&raw)
    }

    #[test]
    fn defaults_are_filled_in() {
        let config = TrainingConfig::from_json(&minimal()).unwrap();

        assert_eq!(config.micro_batch_size, 1);
        assert_eq!(config.global_batch_size, None);
        assert_eq!(config.epoch, 1);
        assert_eq!(config.max_length, DEFAULT_MAX_LENGTH);
        assert_eq!(config.seed, DEFAULT_SEED);
        assert!(config.pseudo_random);
        assert_eq!(config.norm, None);
        assert_eq!(config.precision(), Precision::Fp32Sharded);
    }

    #[test]
    fn bf16_selects_replicated_training() {
        let config = with(r#""bf16": true"#).unwrap();
        assert_eq!(config.precision(), Precision::Bf16);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(with(r#""lr": 0.1"#), Err(ConfigErr::Parse(_))));
    }

    #[test]
    fn a_model_source_is_required() {
        let raw = r#"{ "train_data": "t.jsonl", "optimizer": "type=sgd,lr=0.1" }"#;
        assert!(matches!(
            TrainingConfig::from_json(raw),
            Err(ConfigErr::Invalid(_))
        ));
    }

    #[test]
    fn bad_optimizer_strings_are_fatal() {
        let raw = minimal().replace("type=adamw,lr=1e-3", "type=adamw");
        assert!(matches!(
            TrainingConfig::from_json(&raw),
            Err(ConfigErr::Optimizer(OptimizerErr::MissingKey { .. }))
        ));
    }

    #[test]
    fn negative_norm_is_rejected() {
        assert!(with(r#""norm": -1.0"#).is_err());
        assert_eq!(with(r#""norm": 0.5"#).unwrap().norm, Some(0.5));
    }

    #[test]
    fn plan_derives_steps_from_the_dataset() {
        let config = with(r#""micro_batch_size": 2, "global_batch_size": 8, "epoch": 3"#).unwrap();
        let plan = TrainPlan::resolve(&config, 100, 2).unwrap();

        assert_eq!(plan.max_steps, 100 / 8 * 3);
        assert_eq!(plan.accumulation.steps(), 2);
    }

    #[test]
    fn explicit_max_steps_wins() {
        let config = with(r#""max_steps": 2"#).unwrap();
        let plan = TrainPlan::resolve(&config, 4, 1).unwrap();

        assert_eq!(plan.max_steps, 2);
        assert_eq!(plan.accumulation.steps(), 1);
    }

    #[test]
    fn zero_steps_can_be_asked_for() {
        let config = with(r#""max_steps": 0, "global_batch_size": 8"#).unwrap();
        let plan = TrainPlan::resolve(&config, 7, 1).unwrap();

        assert_eq!(plan.max_steps, 0);
    }

    #[test]
    fn save_dirs_need_a_name() {
        for dir in ["/", ".", "out/.."] {
            let extra = format!(r#""save_dir": {dir:?}"#);
            assert!(matches!(with(&extra), Err(ConfigErr::Invalid(_))), "{dir}");
        }

        let config = with(r#""save_dir": "out/model""#).unwrap();
        assert_eq!(config.save_dir, Some(PathBuf::from("out/model")));
    }

    #[test]
    fn too_small_datasets_have_no_steps() {
        let config = with(r#""global_batch_size": 8"#).unwrap();
        assert!(TrainPlan::resolve(&config, 7, 1).is_err());
    }
}
