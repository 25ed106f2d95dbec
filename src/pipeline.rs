//! Orchestration and ordered shutdown.
//!
//! Stages start consumer-first (persistence, detection, capture) so every
//! frame produced already has a reader. The run ends when any stage exits:
//! normally persistence, on reaching its target. Shutdown then goes
//! upstream-first, so nothing is in flight when a downstream stage stops.

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::channel::bounded;
use crate::detect::{Hysteresis, TickDetector, DEFAULT_MOVING_THRESHOLD, DEFAULT_STILL_THRESHOLD};
use crate::ingest::CameraDriver;
use crate::pool::BufferPool;
use crate::service::{fifo_priority_range, max_cpus, SchedPolicy, Service, ServiceSpec, StopFlag};
use crate::stages::{
    BackpressurePolicy, CaptureOutcome, CaptureReport, CaptureStage, DetectionReport,
    DetectionStage, PersistenceReport, PersistenceStage, DEFAULT_READY_TIMEOUT,
    DEFAULT_RECV_TIMEOUT,
};
use crate::storage::ImageSink;
use crate::PixelEncoding;

/// Default capacity of both inter-stage channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 40;
/// Pool slots needed beyond the tick channel: the detector's previous and
/// current frames plus the one being written.
pub const POOL_HEADROOM: usize = 3;
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Optional CPU for each stage thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageCpus {
    pub capture: Option<usize>,
    pub detection: Option<usize>,
    pub persistence: Option<usize>,
}

impl StageCpus {
    /// Every pinned cpu must fit in an affinity set.
    pub fn validate(&self) -> Result<()> {
        let limit = max_cpus();
        for (stage, cpu) in [
            ("capture", self.capture),
            ("detection", self.detection),
            ("persistence", self.persistence),
        ] {
            if let Some(cpu) = cpu.filter(|&cpu| cpu >= limit) {
                return Err(anyhow!(
                    "{} cpu {} is out of range (must be below {})",
                    stage,
                    cpu,
                    limit
                ));
            }
        }
        Ok(())
    }
}

/// Scheduling priorities, strictly Capture > Detection > Persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagePriorities {
    pub capture: i32,
    pub detection: i32,
    pub persistence: i32,
}

impl StagePriorities {
    pub fn for_policy(policy: SchedPolicy) -> Result<Self> {
        match policy {
            SchedPolicy::Normal => Ok(Self {
                capture: 0,
                detection: 0,
                persistence: 0,
            }),
            SchedPolicy::Fifo => {
                let (min, max) = fifo_priority_range()?;
                if max - 2 < min {
                    return Err(anyhow!(
                        "fixed-priority range {}..={} cannot hold three stages",
                        min,
                        max
                    ));
                }
                Ok(Self {
                    capture: max,
                    detection: max - 1,
                    persistence: max - 2,
                })
            }
        }
    }
}

/// Immutable stage configuration, bound before any stage starts.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub target_frames: u64,
    pub save_all: bool,
    pub still_threshold: f64,
    pub moving_threshold: f64,
    pub capture_capacity: usize,
    pub tick_capacity: usize,
    /// Defaults to `tick_capacity + POOL_HEADROOM`.
    pub pool_capacity: Option<usize>,
    pub capture_interval: Option<Duration>,
    pub backpressure: BackpressurePolicy,
    pub recv_timeout: Duration,
    pub ready_timeout: Duration,
    pub sched_policy: SchedPolicy,
    pub cpus: StageCpus,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_frames: 1,
            save_all: false,
            still_threshold: DEFAULT_STILL_THRESHOLD,
            moving_threshold: DEFAULT_MOVING_THRESHOLD,
            capture_capacity: DEFAULT_CHANNEL_CAPACITY,
            tick_capacity: DEFAULT_CHANNEL_CAPACITY,
            pool_capacity: None,
            capture_interval: None,
            backpressure: BackpressurePolicy::Block,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            sched_policy: SchedPolicy::Fifo,
            cpus: StageCpus::default(),
        }
    }
}

impl PipelineConfig {
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
            .unwrap_or(self.tick_capacity + POOL_HEADROOM)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_frames == 0 {
            return Err(anyhow!("target frame count must be positive"));
        }
        if self.capture_capacity == 0 || self.tick_capacity == 0 {
            return Err(anyhow!("channel capacities must be greater than zero"));
        }
        let pool = self.pool_capacity();
        if pool < 2 {
            return Err(anyhow!(
                "pool capacity {} is too small: detection holds two frames",
                pool
            ));
        }
        if pool < self.tick_capacity + POOL_HEADROOM {
            log::warn!(
                "Pipeline: pool capacity {} below tick channel capacity + {}, expect dropped frames",
                pool,
                POOL_HEADROOM
            );
        }
        Hysteresis::new(self.still_threshold, self.moving_threshold)?;
        if self.recv_timeout.is_zero() || self.ready_timeout.is_zero() {
            return Err(anyhow!("stage timeouts must be non-zero"));
        }
        self.cpus.validate()?;
        Ok(())
    }
}

/// Outcome of a completed or interrupted run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub elapsed: Duration,
    pub capture: CaptureReport,
    pub detection: DetectionReport,
    pub persistence: PersistenceReport,
    pub interrupted: bool,
}

impl PipelineReport {
    pub fn frames_written(&self) -> u64 {
        self.persistence.frames_written
    }

    /// Persisted frames per second.
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_written() as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct Stages {
    capture: Option<Service<CaptureOutcome>>,
    detection: Option<Service<DetectionReport>>,
    persistence: Option<Service<PersistenceReport>>,
}

struct Joined {
    capture: Option<Result<CaptureOutcome>>,
    detection: Option<Result<DetectionReport>>,
    persistence: Option<Result<PersistenceReport>>,
}

impl Stages {
    /// Stop and join upstream-first. Streaming stops once every driver
    /// buffer is back.
    fn shutdown(self) -> Joined {
        let mut capture = self.capture.map(|service| {
            service.request_stop();
            service.join()
        });
        let detection = self.detection.map(|service| {
            service.request_stop();
            service.join()
        });
        if let Some(Ok(outcome)) = capture.as_mut() {
            if let Err(err) = outcome.camera.stop_streaming() {
                log::warn!("Pipeline: stop streaming failed: {:#}", err);
            }
        }
        let persistence = self.persistence.map(|service| {
            service.request_stop();
            service.join()
        });
        Joined {
            capture,
            detection,
            persistence,
        }
    }
}

/// Wires channels, pool and stages for one run.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run until the target count is written, a stage fails, or `interrupt`
    /// is raised. `camera` must have a negotiated format and not be streaming.
    pub fn run(
        &self,
        mut camera: Box<dyn CameraDriver>,
        sink: Box<dyn ImageSink>,
        interrupt: &StopFlag,
    ) -> Result<PipelineReport> {
        let cfg = &self.config;
        let format = camera.format();
        if format.encoding != PixelEncoding::Yuyv {
            return Err(anyhow!(
                "{} delivers {}, only YUYV is supported",
                camera.device(),
                format.encoding
            ));
        }
        if format.width % 2 != 0 {
            return Err(anyhow!(
                "{} delivers width {}, YUYV needs an even width",
                camera.device(),
                format.width
            ));
        }
        let rgb_len = format.rgb_frame_bytes()?;
        let priorities = StagePriorities::for_policy(cfg.sched_policy)?;
        let pool = BufferPool::new(cfg.pool_capacity(), rgb_len);
        let (capture_tx, capture_rx) = bounded(cfg.capture_capacity);
        let (tick_tx, tick_rx) = bounded(cfg.tick_capacity);
        let (exit_tx, exit_rx) = mpsc::channel();
        let spec = |name, priority, cpu| {
            ServiceSpec::new(name, priority, cfg.sched_policy).with_cpu(cpu)
        };

        log::info!(
            "Pipeline: {} on {}, target {} frames, pool {} slots",
            format,
            camera.device(),
            cfg.target_frames,
            pool.capacity()
        );
        let started = Instant::now();
        let mut stages = Stages::default();

        let persistence = PersistenceStage::new(
            tick_rx,
            sink,
            format.width,
            format.height,
            cfg.target_frames,
        )
        .with_save_all(cfg.save_all)
        .with_recv_timeout(cfg.recv_timeout);
        stages.persistence = Some(Service::start(
            spec("persistence", priorities.persistence, cfg.cpus.persistence),
            Some(exit_tx.clone()),
            move |stop| persistence.run(stop),
        )?);

        let detector = TickDetector::new(Hysteresis::new(cfg.still_threshold, cfg.moving_threshold)?);
        let detection = DetectionStage::new(capture_rx, tick_tx, pool.clone(), detector)
            .with_recv_timeout(cfg.recv_timeout)
            .with_forward_all(cfg.save_all);
        match Service::start(
            spec("detection", priorities.detection, cfg.cpus.detection),
            Some(exit_tx.clone()),
            move |stop| detection.run(stop),
        ) {
            Ok(service) => stages.detection = Some(service),
            Err(err) => {
                stages.shutdown();
                return Err(err);
            }
        }

        if let Err(err) = camera.start_streaming() {
            stages.shutdown();
            return Err(err.context(format!("start streaming {}", camera.device())));
        }
        let capture = CaptureStage::new(camera, capture_tx)
            .with_ready_timeout(cfg.ready_timeout)
            .with_interval(cfg.capture_interval)
            .with_policy(cfg.backpressure);
        match Service::start(
            spec("capture", priorities.capture, cfg.cpus.capture),
            Some(exit_tx.clone()),
            move |stop| capture.run(stop),
        ) {
            Ok(service) => stages.capture = Some(service),
            Err(err) => {
                stages.shutdown();
                return Err(err);
            }
        }
        drop(exit_tx);

        let mut interrupted = false;
        loop {
            match exit_rx.recv_timeout(EXIT_POLL) {
                Ok(name) => {
                    log::info!("Pipeline: {} finished, shutting down", name);
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if interrupt.requested() {
                        log::warn!("Pipeline: interrupted, shutting down");
                        interrupted = true;
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let joined = stages.shutdown();
        let elapsed = started.elapsed();
        let (capture, detection, persistence) = first_error(joined)?;

        if let Err(err) = pool.check_invariant() {
            return Err(anyhow::Error::new(err).context("buffer pool accounting after shutdown"));
        }
        let report = PipelineReport {
            elapsed,
            capture: capture.report,
            detection,
            persistence,
            interrupted,
        };
        log::info!(
            "Pipeline: {} frames in {:.3}s ({:.2} fps), {} captured, {} ticks",
            report.frames_written(),
            elapsed.as_secs_f64(),
            report.fps(),
            report.capture.captured,
            report.detection.ticks
        );
        if !interrupted && !report.persistence.reached_target() {
            return Err(anyhow!(
                "pipeline stopped after {} of {} frames",
                report.frames_written(),
                cfg.target_frames
            ));
        }
        Ok(report)
    }
}

/// Surface the first stage failure, upstream first; log the rest.
fn first_error(
    joined: Joined,
) -> Result<(CaptureOutcome, DetectionReport, PersistenceReport)> {
    let mut first: Option<anyhow::Error> = None;
    let mut keep = |err: anyhow::Error| {
        if first.is_none() {
            first = Some(err);
        } else {
            log::error!("Pipeline: {:#}", err);
        }
    };

    let capture = match joined.capture {
        Some(Ok(outcome)) => Some(outcome),
        Some(Err(err)) => {
            keep(err);
            None
        }
        None => None,
    };
    let detection = match joined.detection {
        Some(Ok(report)) => Some(report),
        Some(Err(err)) => {
            keep(err);
            None
        }
        None => None,
    };
    let persistence = match joined.persistence {
        Some(Ok(report)) => Some(report),
        Some(Err(err)) => {
            keep(err);
            None
        }
        None => None,
    };

    if let Some(err) = first {
        return Err(err);
    }
    match (capture, detection, persistence) {
        (Some(c), Some(d), Some(p)) => Ok((c, d, p)),
        _ => Err(anyhow!("pipeline stages did not all run")),
    }
}
