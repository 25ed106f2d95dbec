//! Persistence stage: tick channel to storage.
//!
//! This is the demand end of the pipeline. The stage returns once it has
//! written the target number of frames, and the orchestrator takes that as
//! the signal to shut everything upstream down.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};

use super::DEFAULT_RECV_TIMEOUT;
use crate::channel::{Receiver, RecvTimeoutError};
use crate::pool::PooledBuffer;
use crate::service::StopFlag;
use crate::storage::{ImageRecord, ImageSink};
use crate::WallTime;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistenceReport {
    pub frames_written: u64,
    pub bytes_written: u64,
    /// Received frames that were neither selected nor covered by save-all.
    pub skipped: u64,
    pub target: u64,
}

impl PersistenceReport {
    pub fn reached_target(&self) -> bool {
        self.frames_written >= self.target
    }
}

pub struct PersistenceStage {
    rx: Receiver<PooledBuffer>,
    sink: Box<dyn ImageSink>,
    width: u32,
    height: u32,
    target: u64,
    save_all: bool,
    recv_timeout: Duration,
}

impl PersistenceStage {
    pub fn new(
        rx: Receiver<PooledBuffer>,
        sink: Box<dyn ImageSink>,
        width: u32,
        height: u32,
        target: u64,
    ) -> Self {
        Self {
            rx,
            sink,
            width,
            height,
            target,
            save_all: false,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    pub fn with_save_all(mut self, save_all: bool) -> Self {
        self.save_all = save_all;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn run(mut self, stop: &StopFlag) -> Result<PersistenceReport> {
        let started = Instant::now();
        let mut report = PersistenceReport {
            target: self.target,
            ..PersistenceReport::default()
        };
        log::info!("PersistenceStage: started, target {} frames", self.target);

        while report.frames_written < self.target && !stop.requested() {
            let frame = match self.rx.recv_timeout(self.recv_timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Closed) => {
                    log::debug!("PersistenceStage: tick channel closed");
                    break;
                }
            };
            if !(frame.selected() || self.save_all) {
                report.skipped += 1;
                frame.release()?;
                continue;
            }

            let sequence = report.frames_written + 1;
            let record = ImageRecord {
                sequence,
                timestamp: WallTime::now()?,
                width: self.width,
                height: self.height,
                pixels: frame.as_slice(),
            };
            let bytes = self
                .sink
                .write_image(&record)
                .with_context(|| format!("persist frame {}", sequence))?;
            frame.release()?;

            report.frames_written = sequence;
            report.bytes_written += bytes;
            log::info!(
                "PersistenceStage: frame {} written at {:.3}s, {} bytes",
                sequence,
                started.elapsed().as_secs_f64(),
                bytes
            );
        }

        log::info!(
            "PersistenceStage: stopped with {} of {} frames",
            report.frames_written,
            self.target
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, Priority};
    use crate::pool::BufferPool;
    use crate::storage::MemorySink;

    fn rgb(pool: &BufferPool, value: u8, selected: bool) -> PooledBuffer {
        let mut buf = pool.acquire().expect("pool exhausted");
        buf.as_mut_slice().fill(value);
        let len = buf.capacity();
        buf.set_len(len);
        buf.set_selected(selected);
        buf
    }

    #[test]
    fn writes_selected_frames_until_target() -> Result<()> {
        let pool = BufferPool::new(6, 6);
        let (tx, rx) = bounded(8);
        let sink = MemorySink::new();
        for (value, selected) in [(1, true), (2, false), (3, true), (4, true), (5, true)] {
            tx.send(rgb(&pool, value, selected), Priority::TICK)?;
        }

        let report = PersistenceStage::new(rx, Box::new(sink.clone()), 2, 1, 3)
            .run(&StopFlag::new())?;

        assert!(report.reached_target());
        assert_eq!(report.frames_written, 3);
        assert_eq!(report.skipped, 1);
        let images = sink.images();
        let sequences: Vec<u64> = images.iter().map(|i| i.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(images[2].bytes.ends_with(&[4; 6]));
        assert_eq!(
            report.bytes_written,
            images.iter().map(|i| i.bytes.len() as u64).sum::<u64>()
        );
        // The unread fifth frame went back when the stage dropped its receiver.
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn save_all_keeps_unselected_frames() -> Result<()> {
        let pool = BufferPool::new(2, 3);
        let (tx, rx) = bounded(2);
        let sink = MemorySink::new();
        tx.send(rgb(&pool, 9, false), Priority::TICK)?;
        drop(tx);

        let report = PersistenceStage::new(rx, Box::new(sink.clone()), 1, 1, 5)
            .with_save_all(true)
            .run(&StopFlag::new())?;

        assert_eq!(report.frames_written, 1);
        assert!(!report.reached_target());
        assert_eq!(sink.len(), 1);
        Ok(())
    }

    #[test]
    fn stops_on_request_without_frames() -> Result<()> {
        let (_tx, rx) = bounded::<PooledBuffer>(1);
        let stop = StopFlag::new();
        stop.request();
        let report = PersistenceStage::new(rx, Box::new(MemorySink::new()), 1, 1, 1)
            .with_recv_timeout(Duration::from_millis(10))
            .run(&stop)?;
        assert_eq!(report.frames_written, 0);
        Ok(())
    }
}
