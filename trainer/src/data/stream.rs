use machine_learning::Batch;

use super::DataLoader;
use crate::error::Result;

/// What asking the stream for data gave back.
#[derive(Debug)]
pub enum Fetch {
    Batch(Batch),
    /// The current pass is over, `restart` begins a new one.
    EndOfEpoch,
}

/// A restartable stream of training batches.
#[derive(Debug)]
pub struct BatchStream {
    loader: DataLoader,
    batches: usize,
    restarts: usize,
}

impl BatchStream {
    pub fn new(loader: DataLoader) -> Self {
        Self {
            loader,
            batches: 0,
            restarts: 0,
        }
    }

    /// Fetches the next batch of the current pass.
    pub fn fetch(&mut self) -> Result<Fetch> {
        match self.loader.next_batch()? {
            Some(batch) => {
                self.batches += 1;
                Ok(Fetch::Batch(batch))
            }
            None => Ok(Fetch::EndOfEpoch),
        }
    }

    /// Begins a new pass over the data.
    pub fn restart(&mut self) {
        self.loader.reset();
        self.restarts += 1;
    }

    /// The amount of batches handed out so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }
}
