//! Capture stage: camera to capture channel.

use anyhow::{Context, Result};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{forward, Forward, DEFAULT_READY_TIMEOUT};
use crate::channel::{Priority, Sender};
use crate::frame::{CaptureHandle, DequeueError};
use crate::ingest::{CameraDriver, CameraStats};
use crate::service::StopFlag;

/// What the capture stage does when the capture channel is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait for space. The driver keeps filling its own free slots meanwhile
    /// and drops frames at the device when it runs out.
    #[default]
    Block,
    /// Return the buffer to the driver unprocessed and keep capturing.
    Drop,
}

impl FromStr for BackpressurePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop" => Ok(BackpressurePolicy::Drop),
            other => Err(anyhow::anyhow!(
                "unknown backpressure policy {:?} (expected block or drop)",
                other
            )),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressurePolicy::Block => f.write_str("block"),
            BackpressurePolicy::Drop => f.write_str("drop"),
        }
    }
}

/// Counters kept by the capture stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub captured: u64,
    pub forwarded: u64,
    /// Handles returned to the driver because the channel was full.
    pub dropped: u64,
    pub ready_timeouts: u64,
    pub transient_errors: u64,
    pub camera: CameraStats,
}

/// The camera, handed back so the orchestrator can stop streaming.
pub struct CaptureOutcome {
    pub camera: Box<dyn CameraDriver>,
    pub report: CaptureReport,
}

pub struct CaptureStage {
    camera: Box<dyn CameraDriver>,
    tx: Sender<CaptureHandle>,
    ready_timeout: Duration,
    interval: Option<Duration>,
    policy: BackpressurePolicy,
}

impl CaptureStage {
    /// `camera` must already be streaming.
    pub fn new(camera: Box<dyn CameraDriver>, tx: Sender<CaptureHandle>) -> Self {
        Self {
            camera,
            tx,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            interval: None,
            policy: BackpressurePolicy::default(),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Forward at most one frame per `interval`.
    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn run(self, stop: &StopFlag) -> Result<CaptureOutcome> {
        let Self {
            mut camera,
            tx,
            ready_timeout,
            interval,
            policy,
        } = self;
        let mut report = CaptureReport::default();
        let mut next_due = Instant::now();
        log::info!(
            "CaptureStage: started on {} (backpressure {})",
            camera.device(),
            policy
        );

        while !stop.requested() {
            if !camera
                .wait_readable(ready_timeout)
                .with_context(|| format!("wait for {}", camera.device()))?
            {
                report.ready_timeouts += 1;
                log::debug!("CaptureStage: {} not ready, retrying", camera.device());
                continue;
            }

            let handle = match camera.dequeue() {
                Ok(handle) => handle,
                Err(DequeueError::Empty) => continue,
                Err(DequeueError::Transient(err)) => {
                    report.transient_errors += 1;
                    log::debug!("CaptureStage: transient dequeue error: {}", err);
                    continue;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("dequeue from {}", camera.device())));
                }
            };
            report.captured += 1;
            let sequence = handle.sequence();

            let block = policy == BackpressurePolicy::Block;
            match forward(&tx, handle, Priority::CAPTURE, block, stop) {
                Forward::Sent => report.forwarded += 1,
                Forward::Full(handle) => {
                    report.dropped += 1;
                    log::warn!(
                        "CaptureStage: capture channel full, returning frame {} to driver",
                        sequence
                    );
                    drop(handle);
                }
                Forward::Closed(handle) => {
                    log::debug!("CaptureStage: capture channel closed");
                    drop(handle);
                    break;
                }
            }

            if let Some(interval) = interval {
                next_due += interval;
                pace_until(next_due, stop);
                let now = Instant::now();
                if next_due < now {
                    next_due = now;
                }
            }
        }

        report.camera = camera.stats();
        log::info!(
            "CaptureStage: stopped after {} frames ({} forwarded, {} dropped)",
            report.captured,
            report.forwarded,
            report.dropped
        );
        Ok(CaptureOutcome { camera, report })
    }
}

/// Sleep until `deadline` in short steps so a stop request is seen promptly.
fn pace_until(deadline: Instant, stop: &StopFlag) {
    const STEP: Duration = Duration::from_millis(50);
    loop {
        let now = Instant::now();
        if now >= deadline || stop.requested() {
            return;
        }
        std::thread::sleep((deadline - now).min(STEP));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::bounded;
    use crate::ingest::{SceneSegment, SyntheticCamera, SyntheticConfig};
    use crate::service::{SchedPolicy, Service, ServiceSpec};

    fn streaming_camera(buffers: usize) -> Result<Box<dyn CameraDriver>> {
        streaming_with(SyntheticConfig {
            buffers,
            ..small_scene()
        })
    }

    fn small_scene() -> SyntheticConfig {
        SyntheticConfig {
            width: 4,
            height: 2,
            script: vec![SceneSegment::Moving(1)],
            ..SyntheticConfig::default()
        }
    }

    fn streaming_with(config: SyntheticConfig) -> Result<Box<dyn CameraDriver>> {
        let mut camera = SyntheticCamera::new(config);
        camera.start_streaming()?;
        Ok(Box::new(camera))
    }

    #[test]
    fn forwards_frames_in_capture_order() -> Result<()> {
        let (tx, rx) = bounded(8);
        let stage = CaptureStage::new(streaming_camera(4)?, tx);
        let service = Service::start(
            ServiceSpec::new("capture-test", 0, SchedPolicy::Normal),
            None,
            move |stop| stage.run(stop),
        )?;

        let mut sequences = Vec::new();
        for _ in 0..10 {
            let handle = rx
                .recv_timeout(Duration::from_secs(2))
                .context("no frame")?;
            sequences.push(handle.sequence());
        }
        service.request_stop();
        drop(rx);
        let outcome = service.join()?;

        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
        assert!(outcome.report.forwarded >= 10);
        Ok(())
    }

    #[test]
    fn drop_policy_returns_buffers_when_channel_full() -> Result<()> {
        let (tx, rx) = bounded(1);
        let stage = CaptureStage::new(streaming_camera(3)?, tx)
            .with_policy(BackpressurePolicy::Drop);
        let service = Service::start(
            ServiceSpec::new("capture-drop", 0, SchedPolicy::Normal),
            None,
            move |stop| stage.run(stop),
        )?;

        // Nobody drains the channel: one frame sits in it, the rest bounce.
        let deadline = Instant::now() + Duration::from_secs(5);
        while rx.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        service.request_stop();
        let outcome = service.join()?;

        assert_eq!(outcome.report.forwarded, 1);
        assert!(outcome.report.dropped > 0);
        assert_eq!(outcome.camera.stats().buffers_on_loan, 1);
        drop(rx);
        assert_eq!(outcome.camera.stats().buffers_on_loan, 0);
        Ok(())
    }

    #[test]
    fn policy_parses() -> Result<()> {
        assert_eq!("Block".parse::<BackpressurePolicy>()?, BackpressurePolicy::Block);
        assert_eq!(" drop ".parse::<BackpressurePolicy>()?, BackpressurePolicy::Drop);
        assert!("spill".parse::<BackpressurePolicy>().is_err());
        Ok(())
    }

    #[test]
    fn keeps_capturing_through_transient_dequeue_errors() -> Result<()> {
        let (tx, rx) = bounded(8);
        let camera = streaming_with(SyntheticConfig {
            buffers: 4,
            transient_every: Some(3),
            ..small_scene()
        })?;
        let stage = CaptureStage::new(camera, tx);
        let service = Service::start(
            ServiceSpec::new("capture-transient", 0, SchedPolicy::Normal),
            None,
            move |stop| stage.run(stop),
        )?;

        let mut sequences = Vec::new();
        for _ in 0..6 {
            let handle = rx
                .recv_timeout(Duration::from_secs(2))
                .context("no frame")?;
            sequences.push(handle.sequence());
        }
        service.request_stop();
        drop(rx);
        let outcome = service.join()?;

        // Failed dequeues consume no sequence number.
        assert_eq!(sequences, (0..6).collect::<Vec<_>>());
        assert!(outcome.report.transient_errors >= 2);
        assert_eq!(
            outcome.report.transient_errors,
            outcome.report.camera.transient_errors
        );
        Ok(())
    }

    #[test]
    fn readiness_timeouts_retry_until_buffers_come_back() -> Result<()> {
        let (tx, rx) = bounded(8);
        let stage = CaptureStage::new(streaming_camera(2)?, tx)
            .with_ready_timeout(Duration::from_millis(20));
        let service = Service::start(
            ServiceSpec::new("capture-ready", 0, SchedPolicy::Normal),
            None,
            move |stop| stage.run(stop),
        )?;

        // Both driver buffers sit in the channel, so the camera never turns readable.
        let deadline = Instant::now() + Duration::from_secs(5);
        while rx.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(rx.len(), 2);

        // Draining hands the buffers back and capture resumes in order.
        let mut sequences = Vec::new();
        for _ in 0..6 {
            let handle = rx
                .recv_timeout(Duration::from_secs(2))
                .context("no frame after recovery")?;
            sequences.push(handle.sequence());
        }

        let stopped_at = Instant::now();
        service.request_stop();
        let outcome = service.join()?;
        assert!(stopped_at.elapsed() < Duration::from_secs(1));

        assert_eq!(sequences, (0..6).collect::<Vec<_>>());
        assert!(outcome.report.ready_timeouts > 0);
        assert!(outcome.report.forwarded >= 6);
        drop(rx);
        assert_eq!(outcome.camera.stats().buffers_on_loan, 0);
        Ok(())
    }
}
