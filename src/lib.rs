//! Synchronome
//!
//! A soft real-time frame capture pipeline. Frames are sampled from a camera,
//! a hysteresis detector decides which frames mark the moment a moving scene
//! settles (a "tick"), and only those frames are persisted.
//!
//! # Architecture
//!
//! Three stages run on dedicated fixed-priority threads and talk over bounded
//! priority channels:
//!
//! 1. **Capture**: dequeues driver buffers and forwards `CaptureHandle`s.
//! 2. **Detection**: converts YUYV to RGB into pooled buffers, runs the
//!    tick detector, returns driver buffers immediately and forwards only
//!    selected frames.
//! 3. **Persistence**: writes selected frames to storage until the target
//!    count is reached, which drives pipeline shutdown.
//!
//! Ownership of every buffer is move-only: driver buffers and pool slots are
//! returned exactly once, when their handle is released or dropped.
//!
//! # Module Structure
//!
//! - `service`: real-time thread harness with cooperative stop
//! - `channel`: bounded, priority-ordered mailbox
//! - `pool`: fixed-size buffer pool
//! - `frame`: driver buffer handles
//! - `ingest`: camera drivers (synthetic, V4L2)
//! - `detect`: color conversion and tick detection
//! - `storage`: image sinks
//! - `stages`: the three pipeline stages
//! - `pipeline`: orchestration and ordered shutdown
//! - `config`: file and environment configuration

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod channel;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod pool;
pub mod service;
pub mod stages;
pub mod storage;

pub use channel::{bounded, Priority, Receiver, RecvTimeoutError, SendError, Sender};
pub use detect::{Hysteresis, Mode, TickDetector};
pub use frame::{CaptureHandle, DequeueError, DriverQueue};
pub use ingest::{open_camera, CameraConfig, CameraDriver, SyntheticCamera, SyntheticConfig};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport};
pub use pool::{BufferPool, PoolError, PooledBuffer};
pub use service::{SchedPolicy, Service, ServiceSpec, StopFlag};
pub use storage::{FilesystemSink, ImageRecord, ImageSink, MemorySink, SinkError};

/// Pixel encoding reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelEncoding {
    /// Packed YUV 4:2:2, byte order Y0 U Y1 V.
    Yuyv,
    /// Packed 8-bit RGB.
    Rgb24,
    /// Anything else, kept as its fourcc.
    Other([u8; 4]),
}

impl PixelEncoding {
    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"YUYV" => PixelEncoding::Yuyv,
            b"RGB3" => PixelEncoding::Rgb24,
            _ => PixelEncoding::Other(code),
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelEncoding::Yuyv => *b"YUYV",
            PixelEncoding::Rgb24 => *b"RGB3",
            PixelEncoding::Other(code) => *code,
        }
    }

    /// Bytes per pixel for packed encodings.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match self {
            PixelEncoding::Yuyv => Some(2),
            PixelEncoding::Rgb24 => Some(3),
            PixelEncoding::Other(_) => None,
        }
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Negotiated frame format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl FrameFormat {
    /// Packed format with stride and image size derived from the encoding.
    pub fn packed(width: u32, height: u32, encoding: PixelEncoding) -> Self {
        let bpp = encoding.bytes_per_pixel().unwrap_or(2);
        let bytes_per_line = width.saturating_mul(bpp);
        Self {
            width,
            height,
            encoding,
            bytes_per_line,
            size_image: bytes_per_line.saturating_mul(height),
        }
        .sanitized()
    }

    /// Raise stride and image size to their minimums, as some drivers under-report them.
    pub fn sanitized(mut self) -> Self {
        let min_line = self.width.saturating_mul(2);
        if self.bytes_per_line < min_line {
            self.bytes_per_line = min_line;
        }
        let min_size = self.bytes_per_line.saturating_mul(self.height);
        if self.size_image < min_size {
            self.size_image = min_size;
        }
        self
    }

    /// Bytes of one packed YUYV frame at this geometry.
    pub fn yuyv_frame_bytes(&self) -> Result<usize> {
        let bytes = self
            .width
            .checked_mul(self.height)
            .and_then(|v| v.checked_mul(2))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        Ok(bytes as usize)
    }

    /// Bytes of one packed RGB frame at this geometry.
    pub fn rgb_frame_bytes(&self) -> Result<usize> {
        let bytes = self
            .width
            .checked_mul(self.height)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        Ok(bytes as usize)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (stride {}, {} bytes)",
            self.encoding, self.width, self.height, self.bytes_per_line, self.size_image
        )
    }
}

/// Wall-clock instant split into whole seconds and milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallTime {
    pub secs: u64,
    pub millis: u32,
}

impl WallTime {
    pub fn now() -> Result<Self> {
        Self::from_system(SystemTime::now())
    }

    pub fn from_system(t: SystemTime) -> Result<Self> {
        let since = t.duration_since(UNIX_EPOCH)?;
        Ok(Self {
            secs: since.as_secs(),
            millis: since.subsec_millis(),
        })
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + f64::from(self.millis) / 1000.0
    }
}
