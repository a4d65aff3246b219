//! Per-frame driver.
//!
//! One tick: `Idle -> Acquiring -> (Bypass | Inferring) -> PostProcessing ->
//! Compositing -> Emitting -> Idle`. Ticks never overlap; the inference call is
//! the only place a tick waits on something outside the pipeline. Recurrent
//! state and the previous matte are owned here and only written after a tick
//! has fully succeeded.

use anyhow::{Context, Result};
use image::{RgbImage, RgbaImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::{BackgroundManager, BackgroundSource};
use crate::capture::CaptureSource;
use crate::composite;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metrics::{FrameSample, MetricsRecorder, Stats, StatsObserver};
use crate::output::OutputSink;
use crate::postprocess::MattePostProcessor;
use crate::scheduler::{Decision, FrameSkipScheduler};
use crate::segmentation::{FullMatte, Matte, MattingSession, Preprocessor, RecurrentState};

/// Cooperative teardown flag shared with whoever may stop the pipeline.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn teardown(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquiring,
    Bypass,
    Inferring,
    PostProcessing,
    Compositing,
    Emitting,
}

/// Why a tick skipped matte work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    RawMode,
    NoSession,
    EmptyFrame,
    Failed,
}

/// One finished tick.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub output: RgbaImage,
    /// Set when the tick bypassed matte work.
    pub bypass: Option<BypassReason>,
    /// True only if this tick called the inference session.
    pub inferred: bool,
    /// Latency of the inference that produced the matte used, fresh or reused.
    pub model_time: Option<Duration>,
    pub stats: Option<Stats>,
}

impl Rendered {
    pub fn model_active(&self) -> bool {
        self.bypass.is_none()
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Rendered(Rendered),
    /// Teardown was requested; nothing was written and no further ticks should run.
    TornDown,
}

/// Input geometry a recurrent state was built for.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StateGeometry {
    width: u32,
    height: u32,
    downsample_ratio: f32,
}

struct MatteTick {
    full: FullMatte,
    inferred: bool,
    model_time: Duration,
}

enum TickError {
    TornDown,
    Failed(PipelineError),
}

impl From<PipelineError> for TickError {
    fn from(e: PipelineError) -> Self {
        TickError::Failed(e)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    session: Option<Box<dyn MattingSession>>,
    preprocessor: Preprocessor,
    scheduler: FrameSkipScheduler,
    post: MattePostProcessor,
    background: BackgroundManager,
    metrics: MetricsRecorder,
    state: Option<(StateGeometry, RecurrentState)>,
    frame_size: Option<(u32, u32)>,
    phase: Phase,
    liveness: Liveness,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, background: BackgroundSource) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(config.gamma, config.bilateral),
            scheduler: FrameSkipScheduler::new(config.frame_skip),
            post: MattePostProcessor::new(),
            background: BackgroundManager::new(background, config.background_blur_px),
            metrics: MetricsRecorder::default(),
            session: None,
            state: None,
            frame_size: None,
            phase: Phase::Idle,
            liveness: Liveness::default(),
            config,
        })
    }

    /// Install the inference session. Until then every tick bypasses.
    pub fn attach_session(&mut self, session: Box<dyn MattingSession>) {
        tracing::info!("Inference session attached ({})", session.backend_label());
        self.session = Some(session);
        self.reset_temporal_state();
    }

    pub fn with_session(mut self, session: Box<dyn MattingSession>) -> Self {
        self.attach_session(session);
        self
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn recurrent_state(&self) -> Option<&RecurrentState> {
        self.state.as_ref().map(|(_, s)| s)
    }

    pub fn previous_matte(&self) -> Option<&Matte> {
        self.post.previous()
    }

    /// Background for the current frame. In layered mode this is the layer a
    /// renderer draws beneath the output, so it is kept current in both modes.
    pub fn background(&self) -> &BackgroundManager {
        &self.background
    }

    /// Switch background source; the buffer is rebuilt on the next tick.
    pub fn set_background(&mut self, source: BackgroundSource) {
        self.background.set_source(source);
    }

    /// Apply a new configuration between ticks.
    ///
    /// Backend changes are refused with [`PipelineError::FatalReconfiguration`];
    /// the caller has to build a new session and pipeline.
    pub fn reconfigure(&mut self, next: PipelineConfig) -> Result<(), PipelineError> {
        next.validate()?;
        let delta = self.config.delta(&next);
        if delta.restart_required {
            return Err(PipelineError::FatalReconfiguration(format!(
                "backend change from {} to {}",
                self.config.backend.label(),
                next.backend.label()
            )));
        }

        if delta.shapes_changed {
            tracing::info!(
                "Model geometry changed (scale {} -> {}, ratio {} -> {})",
                self.config.model_scale,
                next.model_scale,
                self.config.downsample_ratio,
                next.downsample_ratio
            );
            self.reset_temporal_state();
        }
        if delta.background_changed {
            self.background.set_blur(next.background_blur_px);
        }
        if delta.adapter_changed {
            self.preprocessor = Preprocessor::new(next.gamma, next.bilateral);
        }
        self.scheduler.set_skip(next.frame_skip);
        self.config = next;
        Ok(())
    }

    fn reset_temporal_state(&mut self) {
        self.state = None;
        self.post.reset();
        self.scheduler.invalidate();
    }

    fn enter(&mut self, phase: Phase) {
        tracing::trace!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn backend_label(&self) -> String {
        self.session
            .as_ref()
            .map_or_else(|| "none".to_string(), |s| s.backend_label())
    }

    /// Process one frame and report stats to `observer` when due.
    pub fn tick(&mut self, frame: &RgbImage, observer: &mut dyn StatsObserver) -> TickOutcome {
        self.tick_from(Instant::now(), frame, observer)
    }

    fn tick_from(
        &mut self,
        started: Instant,
        frame: &RgbImage,
        observer: &mut dyn StatsObserver,
    ) -> TickOutcome {
        if !self.liveness.is_alive() {
            self.enter(Phase::Idle);
            return TickOutcome::TornDown;
        }

        self.enter(Phase::Acquiring);
        self.observe_dimensions(frame);

        let bypass_reason = if frame.width() == 0 || frame.height() == 0 {
            Some(BypassReason::EmptyFrame)
        } else if self.config.raw_mode {
            Some(BypassReason::RawMode)
        } else {
            None
        };

        let mut rendered = match bypass_reason {
            Some(reason) => self.bypass(frame, reason),
            None => match self.matte_tick(frame) {
                Ok(tick) => match self.composite(frame, &tick) {
                    Ok(output) => Rendered {
                        output,
                        bypass: None,
                        inferred: tick.inferred,
                        model_time: Some(tick.model_time),
                        stats: None,
                    },
                    Err(e) => {
                        tracing::warn!("Recoverable frame error: {}", e);
                        self.bypass(frame, BypassReason::Failed)
                    }
                },
                Err(TickError::TornDown) => {
                    tracing::debug!("Discarding inference result after teardown");
                    self.enter(Phase::Idle);
                    return TickOutcome::TornDown;
                }
                Err(TickError::Failed(PipelineError::CollaboratorUnavailable(what))) => {
                    tracing::trace!("{} not attached", what);
                    self.bypass(frame, BypassReason::NoSession)
                }
                Err(TickError::Failed(e)) => {
                    tracing::warn!("Recoverable frame error: {}", e);
                    self.bypass(frame, BypassReason::Failed)
                }
            },
        };

        self.enter(Phase::Emitting);
        let sample = FrameSample {
            frame_time: started.elapsed(),
            model_time: rendered.inferred.then_some(rendered.model_time).flatten(),
            model_active: rendered.model_active(),
        };
        let label = self.backend_label();
        rendered.stats = self.metrics.record(sample, &label, Instant::now());
        if let Some(stats) = &rendered.stats {
            observer.on_stats(stats);
        }

        self.enter(Phase::Idle);
        TickOutcome::Rendered(rendered)
    }

    fn observe_dimensions(&mut self, frame: &RgbImage) {
        let size = frame.dimensions();
        if self.frame_size.is_some_and(|old| old != size) {
            tracing::info!("Frame size changed from {:?} to {:?}", self.frame_size, size);
            self.reset_temporal_state();
        }
        self.frame_size = Some(size);
    }

    fn bypass(&mut self, frame: &RgbImage, reason: BypassReason) -> Rendered {
        self.enter(Phase::Bypass);
        tracing::trace!("Bypass: {:?}", reason);
        Rendered {
            output: composite::bypass(frame),
            bypass: Some(reason),
            inferred: false,
            model_time: None,
            stats: None,
        }
    }

    /// Scheduling decision, inference and post-processing. Commits recurrent
    /// state, the previous matte and the skip cache only when all succeed.
    fn matte_tick(&mut self, frame: &RgbImage) -> Result<MatteTick, TickError> {
        let (width, height) = frame.dimensions();

        let (raw, model_time, next_state) = match self.scheduler.decide() {
            Decision::Reuse => {
                let cached = self.scheduler.cached().ok_or_else(|| {
                    PipelineError::ShapeMismatch("no cached matte to reuse".to_string())
                })?;
                (cached.matte.clone(), cached.model_time, None)
            }
            Decision::Infer => {
                self.enter(Phase::Inferring);
                // Nothing is cached without a session, so a missing one always lands here.
                let session = self
                    .session
                    .as_mut()
                    .ok_or(PipelineError::CollaboratorUnavailable("inference session"))?;
                let (tw, th) = self.config.model_input_size(width, height);
                let ratio = self.config.downsample_ratio;
                let tensor = self.preprocessor.preprocess(frame, tw, th);

                let geometry = StateGeometry {
                    width: tw,
                    height: th,
                    downsample_ratio: ratio,
                };
                if self.state.as_ref().map_or(true, |(g, _)| *g != geometry) {
                    if self.state.is_some() {
                        tracing::debug!("Recurrent state does not fit {}x{}, resetting", tw, th);
                    }
                    self.state = Some((geometry, RecurrentState::zeroed(th, tw, ratio)));
                }
                let Some((_, state)) = self.state.as_ref() else {
                    return Err(PipelineError::ShapeMismatch("recurrent state missing".to_string()).into());
                };

                let _span = tracing::debug_span!("inference").entered();
                let started = Instant::now();
                let result = session.infer(&tensor, state, ratio);
                let model_time = started.elapsed();
                drop(_span);

                if !self.liveness.is_alive() {
                    return Err(TickError::TornDown);
                }

                let output = result.map_err(|e| {
                    self.scheduler.record_failure();
                    PipelineError::TransientInference(e)
                })?;
                (output.matte, model_time, Some((geometry, output.state)))
            }
        };

        self.enter(Phase::PostProcessing);
        let full = self
            .post
            .process(raw.clone(), &self.config.matte, width, height)
            .inspect_err(|_| self.scheduler.record_failure())?;

        let inferred = next_state.is_some();
        if let Some(state) = next_state {
            self.state = Some(state);
            self.scheduler.store(raw, model_time);
        }

        Ok(MatteTick {
            full,
            inferred,
            model_time,
        })
    }

    fn composite(&mut self, frame: &RgbImage, tick: &MatteTick) -> Result<RgbaImage, PipelineError> {
        self.enter(Phase::Compositing);
        if self.config.show_matte {
            return Ok(Preprocessor::matte_to_rgba(&tick.full));
        }
        // Prepared in layered mode too; it is the layer beneath the output.
        let background = self.background.prepare(frame);
        composite::composite(frame, &tick.full, background, self.config.compositing)
    }

    /// Pull frames from `capture` until teardown, writing each result to `output`.
    pub fn run<C, O>(
        &mut self,
        capture: &mut C,
        output: &mut O,
        observer: &mut dyn StatsObserver,
        target_fps: u32,
    ) -> Result<()>
    where
        C: CaptureSource,
        O: OutputSink,
    {
        let frame_duration = Duration::from_secs_f32(1.0 / target_fps.max(1) as f32);

        tracing::info!("Starting main pipeline loop");
        tracing::info!("Press Ctrl+C to stop");

        while self.liveness.is_alive() {
            let loop_start = Instant::now();

            let frame = match capture.capture_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Capture failed: {:#}", e);
                    std::thread::sleep(frame_duration);
                    continue;
                }
            };

            match self.tick_from(loop_start, &frame, observer) {
                TickOutcome::TornDown => break,
                TickOutcome::Rendered(rendered) => output
                    .write_frame(&rendered.output)
                    .context("Failed to write frame")?,
            }

            let elapsed = loop_start.elapsed();
            if elapsed < frame_duration {
                std::thread::sleep(frame_duration - elapsed);
            }
        }

        tracing::info!("Pipeline stopped after {} frames", self.metrics.frame_count());
        Ok(())
    }
}
