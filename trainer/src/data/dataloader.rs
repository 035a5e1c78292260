use std::{ops::Range, sync::Arc};

use machine_learning::Batch;
use rand::{rngs::StdRng, seq::SliceRandom};

use super::{ShardSpec, TokenizedDataset};
use crate::error::Result;

/// Yields padded batches out of one worker's shard of a dataset.
///
/// Without an rng the shard is walked in order, otherwise it's reshuffled
/// on every `reset`.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<TokenizedDataset>,
    shard: ShardSpec,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    pad_token_id: u32,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// Creates a new sequential `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The full dataset, shared among workers in the same process.
    /// * `shard` - Which part of the dataset belongs to this worker.
    /// * `batch_size` - The maximum amount of examples per batch.
    /// * `pad_token_id` - The token used to pad shorter examples.
    pub fn new(
        dataset: Arc<TokenizedDataset>,
        shard: ShardSpec,
        batch_size: usize,
        pad_token_id: u32,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");

        let order = shard.range(dataset.len()).collect();
        Self {
            dataset,
            shard,
            order,
            cursor: 0,
            batch_size,
            pad_token_id,
            rng: None,
        }
    }

    /// Shuffles the shard now and after every `reset`.
    pub fn shuffled(mut self, rng: StdRng) -> Self {
        self.rng = Some(rng);
        self.shuffle();
        self
    }

    fn shuffle(&mut self) {
        if let Some(rng) = &mut self.rng {
            self.order.shuffle(rng);
        }
    }

    pub fn shard(&self) -> ShardSpec {
        self.shard
    }

    /// The indices of the dataset this loader reads from.
    pub fn shard_range(&self) -> Range<usize> {
        self.shard.range(self.dataset.len())
    }

    /// The size of the whole dataset, over every shard.
    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// The amount of examples in this loader's shard.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The amount of batches in one pass over the shard, the last may be short.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Starts a new pass over the shard.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.shuffle();
    }

    /// Produces the next batch of the current pass.
    ///
    /// # Returns
    /// The batch, `None` once the pass is exhausted or an error if an example
    /// can't be collated.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows = self.order[self.cursor..end].iter().map(|&i| {
            let example = self.dataset.get(i);
            (example.input_ids.as_slice(), example.labels.as_slice())
        });

        let batch = Batch::collate(rows, self.pad_token_id)?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use rand::SeedableRng;

    use super::*;
    use crate::data::Example;

    fn dataset(n: u32) -> Arc<TokenizedDataset> {
        let examples = (0..n)
            .map(|i| Example {
                input_ids: vec![i; (i + 1) as usize],
                labels: vec![i64::from(i); (i + 1) as usize],
            })
            .collect();

        Arc::new(TokenizedDataset::new(examples))
    }

    fn first_tokens(loader: &mut DataLoader) -> Vec<u32> {
        let mut tokens = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            tokens.extend(batch.input_ids().column(0).iter().copied());
        }
        tokens
    }

    #[test]
    fn sequential_loader_walks_its_shard_in_order() {
        let shard = ShardSpec::new(1, NonZeroUsize::new(2).unwrap());
        let mut loader = DataLoader::new(dataset(5), shard, 2, 0);

        assert_eq!(loader.shard_range(), 3..5);
        assert_eq!(loader.num_batches(), 1);
        assert_eq!(first_tokens(&mut loader), [3, 4]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn last_batch_may_be_short() {
        let mut loader = DataLoader::new(dataset(5), ShardSpec::single(), 2, 0);

        let sizes: Vec<_> = std::iter::from_fn(|| loader.next_batch().unwrap())
            .map(|b| b.batch_size())
            .collect();

        assert_eq!(sizes, [2, 2, 1]);
    }

    #[test]
    fn batches_are_padded_to_the_sequence_multiple() {
        let mut loader = DataLoader::new(dataset(3), ShardSpec::single(), 3, 99);
        let batch = loader.next_batch().unwrap().unwrap();

        assert_eq!(batch.seq_len(), 8);
        assert_eq!(batch.input_ids()[[0, 1]], 99);
        assert_eq!(batch.attention_mask()[[2, 2]], 1);
        assert_eq!(batch.attention_mask()[[2, 3]], 0);
    }

    #[test]
    fn shuffling_is_reproducible_and_stays_in_the_shard() {
        let shuffled = || {
            DataLoader::new(dataset(20), ShardSpec::single(), 4, 0)
                .shuffled(StdRng::seed_from_u64(3))
        };

        let (mut a, mut b) = (shuffled(), shuffled());
        let first = first_tokens(&mut a);
        assert_eq!(first, first_tokens(&mut b));

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());

        a.reset();
        assert_eq!(first_tokens(&mut a).len(), 20);
    }
}
