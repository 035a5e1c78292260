use std::f64::consts::PI;

/// Linear warmup followed by a half cosine decay to zero.
///
/// The factor at step `s` is `s / warmup` during warmup and
/// `0.5 * (1 + cos(pi * progress))` afterwards, where `progress` goes from 0
/// at the end of warmup to 1 at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupCosine {
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl WarmupCosine {
    /// Creates a new `WarmupCosine` schedule positioned at step 0.
    ///
    /// # Arguments
    /// * `base_lr` - The peak learning rate, reached at the end of warmup.
    /// * `warmup_steps` - The length of the linear warmup.
    /// * `total_steps` - The step at which the rate reaches zero.
    pub fn new(base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    /// Same as `new` with the warmup given as a fraction of `total_steps`.
    pub fn with_ratio(base_lr: f32, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup_steps = (warmup_ratio * total_steps as f64) as usize;
        Self::new(base_lr, warmup_steps, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// How many times the schedule has been advanced.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The multiplier applied to the base rate at `step`.
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        (0.5 * (1. + (PI * progress).cos())).max(0.)
    }

    pub fn lr_at(&self, step: usize) -> f32 {
        (f64::from(self.base_lr) * self.factor(step)) as f32
    }

    /// The rate for the current step.
    pub fn current_lr(&self) -> f32 {
        self.lr_at(self.step)
    }

    /// Moves the schedule forward one step.
    ///
    /// # Returns
    /// The rate for the new step.
    pub fn advance(&mut self) -> f32 {
        self.step += 1;
        self.current_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn warmup_is_linear() {
        let schedule = WarmupCosine::new(1e-3, 4, 20);

        assert_eq!(schedule.lr_at(0), 0.);
        assert!(close(schedule.lr_at(1), 2.5e-4));
        assert!(close(schedule.lr_at(3), 7.5e-4));
        assert!(close(schedule.lr_at(4), 1e-3));
    }

    #[test]
    fn cosine_decays_to_zero() {
        let schedule = WarmupCosine::new(1., 0, 10);

        assert!(close(schedule.lr_at(0), 1.));
        assert!(close(schedule.lr_at(5), 0.5));
        assert!(close(schedule.lr_at(10), 0.));
        assert_eq!(schedule.lr_at(15), 0.);
    }

    #[test]
    fn rate_peaks_at_the_end_of_warmup() {
        let schedule = WarmupCosine::with_ratio(2e-5, 0.1, 100);
        assert_eq!(schedule.warmup_steps(), 10);

        let lrs: Vec<_> = (0..=100).map(|s| schedule.lr_at(s)).collect();
        let (peak, _) = lrs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .unwrap();

        assert_eq!(peak, 10);
        assert!(lrs[..10].windows(2).all(|w| w[0] <= w[1]));
        assert!(lrs[10..].windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn advance_reports_the_next_rate() {
        let mut schedule = WarmupCosine::new(1., 2, 4);
        assert_eq!(schedule.current_lr(), 0.);

        assert!(close(schedule.advance(), 0.5));
        assert!(close(schedule.advance(), 1.));
        assert!(close(schedule.advance(), 0.5));
        assert_eq!(schedule.step(), 3);
    }
}
