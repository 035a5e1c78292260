use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use log::info;
use machine_learning::IGNORE_INDEX;
use serde::Deserialize;

use crate::error::{Result, TrainErr};

/// How raw examples become training sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_length: usize,
    /// Only the response part of an example contributes to the loss.
    pub response_loss_only: bool,
    /// Split long examples into `max_length` windows instead of truncating them.
    pub pretrain: bool,
}

/// A single tokenized sequence with its targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct RawExample {
    input_ids: Vec<u32>,
    #[serde(default)]
    labels: Option<Vec<i64>>,
    #[serde(default)]
    prompt_len: Option<usize>,
}

impl RawExample {
    fn into_examples(self, options: &LoadOptions) -> std::result::Result<Vec<Example>, String> {
        let Self {
            input_ids,
            labels,
            prompt_len,
        } = self;

        if input_ids.is_empty() {
            return Err("input_ids is empty".to_string());
        }

        let mut labels =
            labels.unwrap_or_else(|| input_ids.iter().map(|&id| i64::from(id)).collect());

        if labels.len() != input_ids.len() {
            return Err(format!(
                "{} labels for {} input ids",
                labels.len(),
                input_ids.len()
            ));
        }

        if options.response_loss_only {
            let prompt_len = prompt_len.unwrap_or(0).min(labels.len());
            labels[..prompt_len].fill(IGNORE_INDEX);
        }

        let max = options.max_length;
        if !options.pretrain {
            let len = input_ids.len().min(max);
            return Ok(vec![Example {
                input_ids: input_ids[..len].to_vec(),
                labels: labels[..len].to_vec(),
            }]);
        }

        Ok(input_ids
            .chunks(max)
            .zip(labels.chunks(max))
            .map(|(ids, labels)| Example {
                input_ids: ids.to_vec(),
                labels: labels.to_vec(),
            })
            .collect())
    }
}

/// An in-memory, pre-tokenized dataset.
#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    examples: Vec<Example>,
}

impl TokenizedDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Loads a JSON lines file, one `{"input_ids", "labels"?, "prompt_len"?}` per line.
    ///
    /// # Arguments
    /// * `path` - The file to read.
    /// * `options` - How to turn each line into training sequences.
    ///
    /// # Returns
    /// The dataset or the first malformed line.
    pub fn from_jsonl(path: &Path, options: &LoadOptions) -> Result<Self> {
        let file = File::open(path)?;
        let dataset = Self::from_reader(BufReader::new(file), path, options)?;

        info!(examples = dataset.len(); "loaded {}", path.display());
        Ok(dataset)
    }

    /// Same as `from_jsonl` over any reader, `path` is only used in errors.
    pub fn from_reader<R: BufRead>(reader: R, path: &Path, options: &LoadOptions) -> Result<Self> {
        let mut examples = Vec::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let bad_line = |msg: String| TrainErr::Dataset {
                path: path.to_path_buf(),
                line: i + 1,
                msg,
            };

            let raw: RawExample =
                serde_json::from_str(&line).map_err(|e| bad_line(e.to_string()))?;
            examples.extend(raw.into_examples(options).map_err(bad_line)?);
        }

        Ok(Self { examples })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Returns the example at `idx` (panics if out of bounds).
    #[inline]
    pub fn get(&self, idx: usize) -> &Example {
        &self.examples[idx]
    }
}
