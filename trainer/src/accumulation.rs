use std::num::NonZeroUsize;

use crate::config::ConfigErr;

/// Defines how many micro-steps make up one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulation {
    steps: NonZeroUsize,
}

impl Accumulation {
    pub fn new(steps: NonZeroUsize) -> Self {
        Self { steps }
    }

    /// Derives the accumulation factor from the batch sizes.
    ///
    /// # Arguments
    /// * `global` - The samples per optimizer step over every worker, 1 step when absent.
    /// * `micro` - The samples per forward pass on a single worker.
    /// * `world` - The amount of workers.
    ///
    /// # Returns
    /// The accumulation factor, or an error unless `global` is a positive
    /// multiple of `micro * world`.
    pub fn from_batch_sizes(
        global: Option<usize>,
        micro: usize,
        world: usize,
    ) -> Result<Self, ConfigErr> {
        if micro == 0 || world == 0 {
            return Err(ConfigErr::Invalid(format!(
                "micro_batch_size ({micro}) and world size ({world}) must be positive"
            )));
        }

        let Some(global) = global else {
            return Ok(Self::new(NonZeroUsize::MIN));
        };

        let err = ConfigErr::Accumulation {
            global,
            micro,
            world,
        };

        if global % (micro * world) != 0 {
            return Err(err);
        }

        NonZeroUsize::new(global / micro / world)
            .map(Self::new)
            .ok_or(err)
    }

    pub fn steps(&self) -> usize {
        self.steps.get()
    }

    /// The factor every micro-step loss is scaled by.
    pub fn scale(&self) -> f32 {
        1. / self.steps.get() as f32
    }

    /// Returns true if this micro-step ends an accumulation window.
    #[inline]
    pub fn is_last(&self, micro_step: usize) -> bool {
        let k = self.steps.get();
        (micro_step + 1) % k == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_worker_single_sample() {
        let acc = Accumulation::from_batch_sizes(Some(1), 1, 1).unwrap();
        assert_eq!(acc.steps(), 1);
        assert_eq!(acc.scale(), 1.);
        assert!(acc.is_last(0));
    }

    #[test]
    fn missing_global_batch_means_no_accumulation() {
        let acc = Accumulation::from_batch_sizes(None, 4, 3).unwrap();
        assert_eq!(acc.steps(), 1);
    }

    #[test]
    fn global_batch_is_split_over_micro_batches_and_workers() {
        let acc = Accumulation::from_batch_sizes(Some(64), 4, 2).unwrap();
        assert_eq!(acc.steps(), 8);
        assert_eq!(acc.scale(), 0.125);
    }

    #[test]
    fn uneven_splits_are_rejected() {
        assert!(matches!(
            Accumulation::from_batch_sizes(Some(10), 4, 1),
            Err(ConfigErr::Accumulation { .. })
        ));
        assert!(matches!(
            Accumulation::from_batch_sizes(Some(4), 4, 2),
            Err(ConfigErr::Accumulation { .. })
        ));
        assert!(matches!(
            Accumulation::from_batch_sizes(Some(0), 4, 2),
            Err(ConfigErr::Accumulation { .. })
        ));
    }

    #[test]
    fn windows_close_every_k_micro_steps() {
        let acc = Accumulation::new(NonZeroUsize::new(3).unwrap());
        assert!(!acc.is_last(0));
        assert!(!acc.is_last(1));
        assert!(acc.is_last(2));
        assert!(!acc.is_last(3));
        assert!(!acc.is_last(4));
        assert!(acc.is_last(5));
    }
}
