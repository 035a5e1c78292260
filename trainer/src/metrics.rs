use std::{mem, time::Duration};

/// Loss totals of the current outer step, already averaged over workers.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RunningStats {
    pub loss: f32,
    pub penalty: f32,
}

impl RunningStats {
    #[inline]
    pub fn add(&mut self, loss: f32, penalty: f32) {
        self.loss += loss;
        self.penalty += penalty;
    }

    /// Returns the totals and starts over from zero.
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }
}

/// What a finished run went through.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TrainSummary {
    pub steps: usize,
    pub batches: usize,
    pub epoch_restarts: usize,
    pub optimizer_updates: usize,
    pub final_loss: Option<f32>,
    pub elapsed: Duration,
}

impl TrainSummary {
    #[inline]
    pub fn bump_step(&mut self, loss: f32) {
        self.steps += 1;
        self.final_loss = Some(loss);
    }

    #[inline]
    pub fn add_batches(&mut self, n: usize) {
        self.batches += n;
    }

    #[inline]
    pub fn bump_restart(&mut self) {
        self.epoch_restarts += 1;
    }
}
