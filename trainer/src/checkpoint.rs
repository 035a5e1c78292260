use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{info, warn};
use machine_learning::arch::CausalModel;

use crate::{config::TrainingConfig, dist::Role, error::Result};

const STAGING_SUFFIX: &str = ".staging";
const BACKUP_SUFFIX: &str = ".old";

/// The tokenizer artifacts shipped with every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerFiles {
    dir: PathBuf,
}

impl TokenizerFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Copies every regular file of the tokenizer directory into `dest`.
    ///
    /// # Returns
    /// The amount of copied files.
    pub fn copy_into(&self, dest: &Path) -> io::Result<usize> {
        let mut copied = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            fs::copy(entry.path(), dest.join(entry.file_name()))?;
            copied += 1;
        }

        Ok(copied)
    }
}

/// Writes the trained model into `save_dir`, replacing any previous checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    save_dir: PathBuf,
    tokenizer: Option<TokenizerFiles>,
}

impl CheckpointManager {
    pub fn new(save_dir: impl Into<PathBuf>, tokenizer: Option<TokenizerFiles>) -> Self {
        Self {
            save_dir: save_dir.into(),
            tokenizer,
        }
    }

    /// The manager of a run, `None` when there's nowhere to save.
    pub fn from_config(config: &TrainingConfig) -> Option<Self> {
        let save_dir = config.save_dir.clone()?;

        let tokenizer = match &config.tokenizer_name {
            Some(dir) if dir.is_dir() => Some(TokenizerFiles::new(dir)),
            Some(dir) => {
                warn!("tokenizer {} is not a directory, it won't be saved", dir.display());
                None
            }
            None => None,
        };

        Some(Self::new(save_dir, tokenizer))
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    fn sibling(&self, suffix: &str) -> io::Result<PathBuf> {
        let name = self.save_dir.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} can't be a checkpoint directory", self.save_dir.display()),
            )
        })?;

        let mut name = name.to_os_string();
        name.push(suffix);
        Ok(self.save_dir.with_file_name(name))
    }

    /// Saves `model` and the tokenizer on the primary, replicas do nothing.
    ///
    /// Everything is written to a staging directory first, so a failure
    /// leaves the previous checkpoint as it was.
    ///
    /// # Arguments
    /// * `role` - This worker's role.
    /// * `model` - The bare model, without any penalty wrapper.
    ///
    /// # Returns
    /// Whether a checkpoint was written.
    pub fn save<M: CausalModel>(&self, role: Role, model: &M) -> Result<bool> {
        if !role.is_primary() {
            return Ok(false);
        }

        if let Some(parent) = self.save_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let staging = self.sibling(STAGING_SUFFIX)?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        if let Err(e) = self.write(&staging, model) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        self.swap_in(&staging)?;
        info!("saved checkpoint to {}", self.save_dir.display());
        Ok(true)
    }

    fn write<M: CausalModel>(&self, dir: &Path, model: &M) -> Result<()> {
        model.save_pretrained(dir)?;

        if let Some(tokenizer) = &self.tokenizer {
            let copied = tokenizer.copy_into(dir)?;
            info!(files = copied; "copied tokenizer files");
        }

        Ok(())
    }

    /// Replaces `save_dir` with `staging`, restoring the old one on failure.
    fn swap_in(&self, staging: &Path) -> Result<()> {
        let backup = self.sibling(BACKUP_SUFFIX)?;
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }

        let had_previous = self.save_dir.exists();
        if had_previous {
            fs::rename(&self.save_dir, &backup)?;
        }

        if let Err(e) = fs::rename(staging, &self.save_dir) {
            if had_previous {
                fs::rename(&backup, &self.save_dir)?;
            }
            return Err(e.into());
        }

        if had_previous {
            fs::remove_dir_all(&backup)?;
        }

        Ok(())
    }
}
