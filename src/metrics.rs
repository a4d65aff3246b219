use std::time::{Duration, Instant};

/// Minimum wall-clock gap between two emitted snapshots.
pub const EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Snapshot handed to a [`StatsObserver`].
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub fps: f64,
    pub avg_fps: f64,
    pub model_time_ms: f64,
    pub frame_time_ms: f64,
    pub backend_label: String,
    pub model_active: bool,
}

/// Receiver of throttled stats snapshots.
pub trait StatsObserver {
    fn on_stats(&mut self, stats: &Stats);
}

impl<F: FnMut(&Stats)> StatsObserver for F {
    fn on_stats(&mut self, stats: &Stats) {
        self(stats)
    }
}

/// Observer that writes snapshots to the log.
pub struct LogObserver;

impl StatsObserver for LogObserver {
    fn on_stats(&mut self, stats: &Stats) {
        if stats.model_active {
            tracing::info!(
                "fps={:.1} avg={:.1} model={:.1}ms frame={:.1}ms backend={}",
                stats.fps,
                stats.avg_fps,
                stats.model_time_ms,
                stats.frame_time_ms,
                stats.backend_label
            );
        } else {
            tracing::info!(
                "fps={:.1} avg={:.1} frame={:.1}ms (model inactive)",
                stats.fps,
                stats.avg_fps,
                stats.frame_time_ms
            );
        }
    }
}

/// Timing of one finished tick.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample {
    pub frame_time: Duration,
    /// Set only when the tick actually ran inference.
    pub model_time: Option<Duration>,
    pub model_active: bool,
}

fn as_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

#[derive(Debug)]
pub struct MetricsRecorder {
    interval: Duration,
    frame_count: u64,
    total_frame_ms: f64,
    last_model_ms: f64,
    last_emit: Option<Instant>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(EMIT_INTERVAL)
    }
}

impl MetricsRecorder {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            frame_count: 0,
            total_frame_ms: 0.0,
            last_model_ms: 0.0,
            last_emit: None,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn avg_fps(&self) -> f64 {
        if self.total_frame_ms > 0.0 {
            self.frame_count as f64 * 1000.0 / self.total_frame_ms
        } else {
            0.0
        }
    }

    /// Account for a tick; returns a snapshot when one is due at `now`.
    pub fn record(&mut self, sample: FrameSample, backend_label: &str, now: Instant) -> Option<Stats> {
        let frame_time_ms = as_ms(sample.frame_time);
        self.frame_count += 1;
        self.total_frame_ms += frame_time_ms;
        if let Some(model_time) = sample.model_time {
            self.last_model_ms = as_ms(model_time);
        }

        let due = self
            .last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        self.last_emit = Some(now);

        Some(Stats {
            fps: if frame_time_ms > 0.0 { 1000.0 / frame_time_ms } else { 0.0 },
            avg_fps: self.avg_fps(),
            model_time_ms: if sample.model_active { self.last_model_ms } else { 0.0 },
            frame_time_ms,
            backend_label: backend_label.to_string(),
            model_active: sample.model_active,
        })
    }
}
