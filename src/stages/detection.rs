//! Detection stage: capture channel to tick channel.
//!
//! Every captured frame is converted into a pooled RGB buffer and its driver
//! buffer is returned before detection runs. Only ticks (or every frame when
//! saving all) travel on; everything else goes straight back to the pool.

use anyhow::{Context, Result};
use std::time::Duration;

use super::{forward, Forward, DEFAULT_RECV_TIMEOUT};
use crate::channel::{Priority, Receiver, RecvTimeoutError, Sender};
use crate::detect::{yuyv_to_rgb, DetectError, TickDetector};
use crate::frame::CaptureHandle;
use crate::pool::{BufferPool, PooledBuffer};
use crate::service::StopFlag;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub received: u64,
    pub converted: u64,
    /// Frames dropped because no pool slot was free.
    pub pool_exhausted: u64,
    pub ticks: u64,
    pub forwarded: u64,
    /// Forwardable frames released because a stop arrived while blocked.
    pub discarded: u64,
}

pub struct DetectionStage {
    rx: Receiver<CaptureHandle>,
    tx: Sender<PooledBuffer>,
    pool: BufferPool,
    detector: TickDetector,
    /// Capture byte count fixed by the first frame.
    expected_capture_len: Option<usize>,
    recv_timeout: Duration,
    forward_all: bool,
}

impl DetectionStage {
    pub fn new(
        rx: Receiver<CaptureHandle>,
        tx: Sender<PooledBuffer>,
        pool: BufferPool,
        detector: TickDetector,
    ) -> Self {
        Self {
            rx,
            tx,
            pool,
            detector,
            expected_capture_len: None,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            forward_all: false,
        }
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Forward every displaced frame, not only ticks.
    pub fn with_forward_all(mut self, forward_all: bool) -> Self {
        self.forward_all = forward_all;
        self
    }

    pub fn run(mut self, stop: &StopFlag) -> Result<DetectionReport> {
        let mut report = DetectionReport::default();
        log::info!(
            "DetectionStage: started (pool {} x {} bytes)",
            self.pool.capacity(),
            self.pool.slot_len()
        );

        while !stop.requested() {
            let handle = match self.rx.recv_timeout(self.recv_timeout) {
                Ok(handle) => handle,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Closed) => {
                    log::debug!("DetectionStage: capture channel closed");
                    break;
                }
            };
            report.received += 1;

            let actual = handle.bytes_used();
            let expected = *self.expected_capture_len.get_or_insert(actual);
            if actual != expected {
                let err = DetectError::FrameSizeMismatch { expected, actual };
                return Err(anyhow::Error::new(err)
                    .context(format!("capture frame {}", handle.sequence())));
            }

            let Some(mut rgb) = self.pool.acquire() else {
                report.pool_exhausted += 1;
                log::warn!(
                    "DetectionStage: pool exhausted, dropping frame {}",
                    handle.sequence()
                );
                continue;
            };

            let format = handle.format();
            let written = yuyv_to_rgb(handle.bytes(), &format, rgb.as_mut_slice())
                .with_context(|| format!("convert frame {}", handle.sequence()))?;
            rgb.set_len(written);
            handle
                .release()
                .context("return capture buffer to driver")?;
            report.converted += 1;

            let Some(displaced) = self.detector.process(rgb)? else {
                continue;
            };
            if displaced.selected() {
                report.ticks += 1;
                log::info!(
                    "DetectionStage: tick {} after {} frames",
                    report.ticks,
                    self.detector.frames()
                );
            }
            if !(displaced.selected() || self.forward_all) {
                self.pool.release(displaced)?;
                continue;
            }

            match forward(&self.tx, displaced, Priority::TICK, true, stop) {
                Forward::Sent => report.forwarded += 1,
                Forward::Full(frame) => {
                    report.discarded += 1;
                    self.pool.release(frame)?;
                }
                Forward::Closed(frame) => {
                    log::debug!("DetectionStage: tick channel closed");
                    self.pool.release(frame)?;
                    break;
                }
            }
        }

        log::info!(
            "DetectionStage: stopped after {} frames ({} ticks, {} pool drops)",
            report.converted,
            report.ticks,
            report.pool_exhausted
        );
        Ok(report)
    }
}
