use model::execution::options::AdaptiveBatchConfig;
use std::time::Duration;

/// Per-entity batch-size controller aiming at a fixed wall-clock per batch.
///
/// After each observed batch the size moves halfway towards the size that
/// would have hit the target, clamped to the configured bounds.
#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    current: usize,
    config: AdaptiveBatchConfig,
}

impl AdaptiveBatchSizer {
    pub fn new(initial: usize, config: AdaptiveBatchConfig) -> Self {
        let current = initial.clamp(config.min_size, config.max_size);
        Self { current, config }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn observe(&mut self, batch_size: usize, elapsed: Duration) {
        let elapsed_secs = elapsed.as_secs_f64();
        if batch_size == 0 || elapsed_secs <= 0.0 {
            return;
        }
        let records_per_second = batch_size as f64 / elapsed_secs;
        let target = records_per_second * self.config.target_seconds;
        let next = ((self.current as f64 + target) / 2.0).round() as usize;
        self.current = next.clamp(self.config.min_size, self.config.max_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: usize, max: usize, target: f64) -> AdaptiveBatchConfig {
        AdaptiveBatchConfig {
            min_size: min,
            max_size: max,
            target_seconds: target,
        }
    }

    #[test]
    fn slow_batches_shrink_the_size() {
        let mut sizer = AdaptiveBatchSizer::new(100, config(10, 500, 10.0));
        // 100 records in 100 s -> 1 rps -> target 10.
        sizer.observe(100, Duration::from_secs(100));
        assert_eq!(sizer.current(), 55);
        sizer.observe(55, Duration::from_secs(55));
        assert!(sizer.current() < 55);
    }

    #[test]
    fn fast_batches_grow_towards_the_cap() {
        let mut sizer = AdaptiveBatchSizer::new(100, config(10, 500, 10.0));
        // 100 records in 1 s -> 100 rps -> target 1000, clamped by max.
        sizer.observe(100, Duration::from_secs(1));
        assert_eq!(sizer.current(), 500);
    }

    #[test]
    fn zero_inputs_are_no_ops() {
        let mut sizer = AdaptiveBatchSizer::new(100, config(10, 500, 10.0));
        sizer.observe(0, Duration::from_secs(5));
        sizer.observe(100, Duration::ZERO);
        assert_eq!(sizer.current(), 100);
    }

    #[test]
    fn initial_size_is_clamped() {
        let sizer = AdaptiveBatchSizer::new(5, config(10, 500, 10.0));
        assert_eq!(sizer.current(), 10);
    }
}
