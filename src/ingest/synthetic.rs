//! Synthetic camera for `stub://` devices and tests.
//!
//! Generates packed YUYV frames from a scripted scene: runs of still frames
//! (identical pixels) and moving frames (the pattern shifts every frame).
//! Buffer slots behave like a real driver's: a slot on loan is not refilled
//! until its handle comes back, so a pipeline that holds every slot starves
//! the camera exactly as it would starve a V4L2 device.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use super::{CameraConfig, CameraDriver, CameraStats, FORCED_HEIGHT, FORCED_WIDTH};
use crate::frame::{CaptureHandle, DequeueError, DriverQueue, DriverSlot, SlotMemory};
use crate::{FrameFormat, PixelEncoding};

/// Pattern shift applied per moving frame.
const MOTION_STEP: u32 = 37;

/// One run of the scripted scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneSegment {
    /// `n` frames with no change.
    Still(u32),
    /// `n` frames, each shifted from the last.
    Moving(u32),
}

/// Configuration for a synthetic camera.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Driver buffer slots.
    pub buffers: usize,
    pub script: Vec<SceneSegment>,
    /// Replay the script forever. Otherwise the scene stays still once it ends.
    pub repeat: bool,
    /// Simulated sensor frame period.
    pub frame_interval: Option<Duration>,
    /// Maximum luma noise added per sample.
    pub noise: u8,
    pub seed: u64,
    /// Fail every n-th dequeue with a transient error.
    pub transient_every: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device: "stub://synthetic".to_string(),
            width: 64,
            height: 48,
            buffers: 6,
            script: vec![SceneSegment::Still(3), SceneSegment::Moving(3)],
            repeat: true,
            frame_interval: None,
            noise: 0,
            seed: 0,
            transient_every: None,
        }
    }
}

struct BankState {
    /// Driver-held storage; `None` while the slot is on loan.
    slots: Vec<Option<Box<[u8]>>>,
    /// Slots ready to be filled, oldest first.
    queued: VecDeque<usize>,
}

/// Buffer slots shared between the camera and outstanding handles.
struct SlotBank {
    state: Mutex<BankState>,
    returned: Condvar,
}

impl SlotBank {
    fn lock(&self) -> MutexGuard<'_, BankState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DriverQueue for SlotBank {
    fn requeue(&self, slot: DriverSlot) -> io::Result<()> {
        let mut state = self.lock();
        let entry = state.slots.get_mut(slot.index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown buffer index {}", slot.index),
            )
        })?;
        if entry.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer {} returned while not on loan", slot.index),
            ));
        }
        match slot.memory {
            SlotMemory::Owned(data) => *entry = Some(data),
            SlotMemory::Mapped(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "mapped memory returned to synthetic camera",
                ))
            }
        }
        state.queued.push_back(slot.index);
        drop(state);
        self.returned.notify_all();
        Ok(())
    }
}

/// Scripted YUYV frame source.
pub struct SyntheticCamera {
    config: SyntheticConfig,
    format: FrameFormat,
    bank: Arc<SlotBank>,
    streaming: bool,
    rng: StdRng,
    segment: usize,
    frames_in_segment: u32,
    phase: u32,
    sequence: u64,
    dequeue_attempts: u64,
    transient_errors: u64,
    next_frame_at: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticConfig) -> Self {
        let format = FrameFormat::packed(config.width, config.height, PixelEncoding::Yuyv);
        let slot_len = format.size_image as usize;
        let bank = Arc::new(SlotBank {
            state: Mutex::new(BankState {
                slots: (0..config.buffers)
                    .map(|_| Some(vec![0u8; slot_len].into_boxed_slice()))
                    .collect(),
                queued: VecDeque::new(),
            }),
            returned: Condvar::new(),
        });
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            format,
            bank,
            streaming: false,
            segment: 0,
            frames_in_segment: 0,
            phase: 0,
            sequence: 0,
            dequeue_attempts: 0,
            transient_errors: 0,
            next_frame_at: None,
        }
    }

    /// Synthetic camera at the forced geometry, paced at roughly 30 fps.
    pub fn from_camera_config(config: &CameraConfig) -> Self {
        Self::new(SyntheticConfig {
            device: config.device.clone(),
            width: FORCED_WIDTH,
            height: FORCED_HEIGHT,
            buffers: config.buffers as usize,
            frame_interval: Some(Duration::from_millis(33)),
            ..SyntheticConfig::default()
        })
    }

    /// Advance the script by one frame and report whether the scene moved.
    fn advance_scene(&mut self) -> bool {
        loop {
            let Some(segment) = self.config.script.get(self.segment).copied() else {
                if self.config.repeat && !self.config.script.is_empty() {
                    self.segment = 0;
                    continue;
                }
                return false;
            };
            let (len, moving) = match segment {
                SceneSegment::Still(n) => (n, false),
                SceneSegment::Moving(n) => (n, true),
            };
            if self.frames_in_segment < len {
                self.frames_in_segment += 1;
                return moving;
            }
            self.segment += 1;
            self.frames_in_segment = 0;
        }
    }

    fn render(&mut self, out: &mut [u8]) -> usize {
        if self.advance_scene() {
            self.phase = self.phase.wrapping_add(MOTION_STEP);
        }
        let width = self.format.width as usize;
        let stride = self.format.bytes_per_line as usize;
        let used = stride * self.format.height as usize;
        for (row, line) in out[..used].chunks_exact_mut(stride).enumerate() {
            for (pair, px) in line[..width * 2].chunks_exact_mut(4).enumerate() {
                let x = (pair * 2) as u32;
                let base = x + row as u32 + self.phase;
                px[0] = luma(base, self.config.noise, &mut self.rng);
                px[1] = 128;
                px[2] = luma(base + 1, self.config.noise, &mut self.rng);
                px[3] = 128;
            }
        }
        used
    }

    fn pace(&mut self, timeout: Duration) -> bool {
        let Some(interval) = self.config.frame_interval else {
            return true;
        };
        let now = Instant::now();
        let due = *self.next_frame_at.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return false;
            }
            std::thread::sleep(wait);
        }
        self.next_frame_at = Some(due.max(now) + interval);
        true
    }
}

fn luma(base: u32, noise: u8, rng: &mut StdRng) -> u8 {
    let value = 16 + (base.wrapping_mul(5) % 220) as u8;
    if noise == 0 {
        value
    } else {
        value.saturating_add(rng.gen_range(0..=noise)).min(235)
    }
}

impl CameraDriver for SyntheticCamera {
    fn device(&self) -> &str {
        &self.config.device
    }

    fn negotiate_format(&mut self) -> Result<FrameFormat> {
        Ok(self.format)
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn start_streaming(&mut self) -> Result<()> {
        let mut state = self.bank.lock();
        state.queued = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| index)
            .collect();
        drop(state);
        self.streaming = true;
        log::info!(
            "SyntheticCamera: streaming {} ({} buffers)",
            self.config.device,
            self.config.buffers
        );
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.streaming = false;
        self.bank.lock().queued.clear();
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        if !self.streaming {
            return Err(anyhow!("{} is not streaming", self.config.device));
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.bank.lock();
        while state.queued.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .bank
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(state);
        Ok(self.pace(deadline.saturating_duration_since(Instant::now())))
    }

    fn dequeue(&mut self) -> Result<CaptureHandle, DequeueError> {
        if !self.streaming {
            return Err(DequeueError::Fatal(io::Error::new(
                io::ErrorKind::Other,
                "dequeue while not streaming",
            )));
        }
        self.dequeue_attempts += 1;
        if let Some(n) = self.config.transient_every {
            if n > 0 && self.dequeue_attempts % n == 0 {
                self.transient_errors += 1;
                return Err(DequeueError::Transient(io::Error::new(
                    io::ErrorKind::Other,
                    "simulated transient I/O error",
                )));
            }
        }

        let (index, mut data) = {
            let mut state = self.bank.lock();
            let Some(index) = state.queued.pop_front() else {
                return Err(DequeueError::Empty);
            };
            let Some(data) = state.slots[index].take() else {
                return Err(DequeueError::Fatal(io::Error::new(
                    io::ErrorKind::Other,
                    format!("queued buffer {} is on loan", index),
                )));
            };
            (index, data)
        };

        let used = self.render(&mut data);
        let sequence = self.sequence;
        self.sequence += 1;
        let queue: Arc<dyn DriverQueue> = self.bank.clone();
        Ok(CaptureHandle::new(
            DriverSlot {
                index,
                memory: SlotMemory::Owned(data),
            },
            used,
            self.format,
            sequence,
            SystemTime::now(),
            queue,
        ))
    }

    fn stats(&self) -> CameraStats {
        let state = self.bank.lock();
        CameraStats {
            frames_dequeued: self.sequence,
            buffers_on_loan: state.slots.iter().filter(|s| s.is_none()).count(),
            transient_errors: self.transient_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(script: Vec<SceneSegment>, buffers: usize) -> Result<SyntheticCamera> {
        let mut cam = SyntheticCamera::new(SyntheticConfig {
            width: 8,
            height: 4,
            buffers,
            script,
            repeat: false,
            ..SyntheticConfig::default()
        });
        cam.start_streaming()?;
        Ok(cam)
    }

    #[test]
    fn produces_packed_yuyv_frames() -> Result<()> {
        let mut cam = camera(vec![SceneSegment::Still(1)], 2)?;
        assert!(cam.wait_readable(Duration::from_millis(10))?);
        let frame = cam.dequeue()?;
        assert_eq!(frame.bytes_used(), 8 * 4 * 2);
        assert_eq!(frame.bytes()[1], 128);
        assert_eq!(frame.bytes()[3], 128);
        assert!(frame.bytes().iter().step_by(2).all(|y| (16..=235).contains(y)));
        Ok(())
    }

    #[test]
    fn still_frames_identical_moving_frames_differ() -> Result<()> {
        let mut cam = camera(
            vec![SceneSegment::Still(2), SceneSegment::Moving(1)],
            4,
        )?;
        let a = cam.dequeue()?.bytes().to_vec();
        let b = cam.dequeue()?.bytes().to_vec();
        let c = cam.dequeue()?.bytes().to_vec();
        assert_eq!(a, b);
        assert_ne!(b, c);
        Ok(())
    }

    #[test]
    fn slots_on_loan_starve_the_camera() -> Result<()> {
        let mut cam = camera(vec![], 2)?;
        let first = cam.dequeue()?;
        let second = cam.dequeue()?;
        assert!(matches!(cam.dequeue(), Err(DequeueError::Empty)));
        assert!(!cam.wait_readable(Duration::from_millis(5))?);
        assert_eq!(cam.stats().buffers_on_loan, 2);

        drop(first);
        assert!(cam.wait_readable(Duration::from_millis(5))?);
        let third = cam.dequeue()?;
        assert_eq!(third.index(), 0);
        second.release()?;
        drop(third);
        assert_eq!(cam.stats().buffers_on_loan, 0);
        Ok(())
    }

    #[test]
    fn transient_errors_are_injected() -> Result<()> {
        let mut cam = SyntheticCamera::new(SyntheticConfig {
            width: 4,
            height: 2,
            transient_every: Some(2),
            ..SyntheticConfig::default()
        });
        cam.start_streaming()?;
        assert!(cam.dequeue().is_ok());
        assert!(matches!(cam.dequeue(), Err(DequeueError::Transient(_))));
        assert!(cam.dequeue().is_ok());
        assert_eq!(cam.stats().transient_errors, 1);
        Ok(())
    }

    #[test]
    fn dequeue_before_streaming_is_fatal() {
        let mut cam = SyntheticCamera::new(SyntheticConfig::default());
        assert!(cam.dequeue().unwrap_err().is_fatal());
    }
}
