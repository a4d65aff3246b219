use std::time::Duration;

use crate::segmentation::Matte;

/// Last successful inference result, reused on skipped ticks.
#[derive(Debug, Clone)]
pub struct CachedMatte {
    pub matte: Matte,
    pub model_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Infer,
    Reuse,
}

/// Runs inference on one tick out of every `skip + 1`.
///
/// Cold start (nothing cached) always infers. A failed inference keeps the
/// next tick an inference tick.
#[derive(Debug, Default)]
pub struct FrameSkipScheduler {
    skip: u32,
    since_inference: u32,
    cached: Option<CachedMatte>,
}

impl FrameSkipScheduler {
    pub fn new(skip: u32) -> Self {
        Self {
            skip,
            ..Self::default()
        }
    }

    pub fn set_skip(&mut self, skip: u32) {
        self.skip = skip;
        self.since_inference = self.since_inference.min(skip);
    }

    pub fn decide(&mut self) -> Decision {
        if self.cached.is_none() || self.since_inference >= self.skip {
            self.since_inference = 0;
            Decision::Infer
        } else {
            self.since_inference += 1;
            Decision::Reuse
        }
    }

    pub fn store(&mut self, matte: Matte, model_time: Duration) {
        self.cached = Some(CachedMatte { matte, model_time });
    }

    pub fn cached(&self) -> Option<&CachedMatte> {
        self.cached.as_ref()
    }

    pub fn record_failure(&mut self) {
        self.since_inference = self.skip;
    }

    /// Drop the cached matte; the next tick infers.
    pub fn invalidate(&mut self) {
        self.cached = None;
        self.since_inference = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scheduler: &mut FrameSkipScheduler, ticks: usize) -> Vec<Decision> {
        (0..ticks)
            .map(|i| {
                let decision = scheduler.decide();
                if decision == Decision::Infer {
                    scheduler.store(Matte::from_elem((1, 1), i as f32), Duration::from_millis(i as u64));
                }
                decision
            })
            .collect()
    }

    #[test]
    fn zero_skip_always_infers() {
        let mut scheduler = FrameSkipScheduler::new(0);
        assert!(run(&mut scheduler, 10).iter().all(|d| *d == Decision::Infer));
    }

    #[test]
    fn one_inference_per_window() {
        for skip in 1..5u32 {
            let mut scheduler = FrameSkipScheduler::new(skip);
            let decisions = run(&mut scheduler, 40);
            assert_eq!(decisions[0], Decision::Infer);
            for window in decisions.windows(skip as usize + 1) {
                let infers = window.iter().filter(|d| **d == Decision::Infer).count();
                assert_eq!(infers, 1, "skip={skip}");
            }
        }
    }

    #[test]
    fn reused_ticks_keep_matte_and_latency() {
        let mut scheduler = FrameSkipScheduler::new(2);
        assert_eq!(scheduler.decide(), Decision::Infer);
        scheduler.store(Matte::from_elem((1, 1), 0.7), Duration::from_millis(12));
        for _ in 0..2 {
            assert_eq!(scheduler.decide(), Decision::Reuse);
            let cached = scheduler.cached().unwrap();
            assert_eq!(cached.matte[[0, 0]], 0.7);
            assert_eq!(cached.model_time, Duration::from_millis(12));
        }
        assert_eq!(scheduler.decide(), Decision::Infer);
    }

    #[test]
    fn cold_start_and_invalidate_force_inference() {
        let mut scheduler = FrameSkipScheduler::new(3);
        assert_eq!(scheduler.decide(), Decision::Infer);
        // No store: the inference failed or was discarded.
        assert_eq!(scheduler.decide(), Decision::Infer);

        scheduler.store(Matte::zeros((1, 1)), Duration::ZERO);
        assert_eq!(scheduler.decide(), Decision::Reuse);
        scheduler.invalidate();
        assert_eq!(scheduler.decide(), Decision::Infer);
    }

    #[test]
    fn failure_retries_next_tick() {
        let mut scheduler = FrameSkipScheduler::new(3);
        assert_eq!(scheduler.decide(), Decision::Infer);
        scheduler.store(Matte::zeros((1, 1)), Duration::ZERO);
        assert_eq!(run(&mut scheduler, 3), vec![Decision::Reuse; 3]);
        assert_eq!(scheduler.decide(), Decision::Infer);
        scheduler.record_failure();
        assert_eq!(scheduler.decide(), Decision::Infer);
    }
}
