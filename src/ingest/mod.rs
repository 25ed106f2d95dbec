//! Camera drivers.
//!
//! This module provides the frame sources the capture stage drives:
//! - Synthetic scene generator (`stub://` device paths, always built)
//! - V4L2 memory-mapped streaming (feature: ingest-v4l2)
//!
//! A driver owns a small, fixed set of buffer slots. `dequeue` loans one
//! filled slot out as a `CaptureHandle`; the slot comes back through the
//! handle's `DriverQueue` when the handle is released or dropped. Only the
//! capture stage calls the driver directly.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::{CaptureHandle, DequeueError};
use crate::FrameFormat;

pub mod synthetic;
#[cfg(all(feature = "ingest-v4l2", target_os = "linux"))]
pub mod v4l2;

pub use synthetic::{SceneSegment, SyntheticCamera, SyntheticConfig};
#[cfg(all(feature = "ingest-v4l2", target_os = "linux"))]
pub use v4l2::V4l2Camera;

/// Width used when a format is forced.
pub const FORCED_WIDTH: u32 = 640;
/// Height used when a format is forced.
pub const FORCED_HEIGHT: u32 = 480;
/// Driver buffer slots requested by default.
pub const DEFAULT_DRIVER_BUFFERS: u32 = 6;

/// Device selection and format preferences.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0") or `stub://<name>`.
    pub device: String,
    /// Negotiate 640x480 YUYV instead of keeping the driver's current format.
    pub force_format: bool,
    /// Driver buffer slots to request.
    pub buffers: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            force_format: false,
            buffers: DEFAULT_DRIVER_BUFFERS,
        }
    }
}

/// Counters reported by a driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub frames_dequeued: u64,
    pub buffers_on_loan: usize,
    pub transient_errors: u64,
}

/// The camera capability consumed by the capture stage.
pub trait CameraDriver: Send {
    /// Device path this driver was opened on.
    fn device(&self) -> &str;

    /// Agree on a frame format with the device.
    fn negotiate_format(&mut self) -> Result<FrameFormat>;

    /// The most recently negotiated format.
    fn format(&self) -> FrameFormat;

    fn start_streaming(&mut self) -> Result<()>;

    fn stop_streaming(&mut self) -> Result<()>;

    /// Wait up to `timeout` for a filled buffer. `false` on timeout or interruption.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;

    /// Loan out the oldest filled buffer.
    fn dequeue(&mut self) -> Result<CaptureHandle, DequeueError>;

    fn stats(&self) -> CameraStats;
}

/// Open `config.device` and negotiate its format.
pub fn open_camera(config: &CameraConfig) -> Result<Box<dyn CameraDriver>> {
    if config.buffers < 2 {
        return Err(anyhow!(
            "at least 2 driver buffers are required, got {}",
            config.buffers
        ));
    }
    let mut driver: Box<dyn CameraDriver> = if config.device.starts_with("stub://") {
        Box::new(SyntheticCamera::from_camera_config(config))
    } else {
        open_device(config)?
    };
    let format = driver.negotiate_format()?;
    log::info!("Camera: {} negotiated {}", driver.device(), format);
    Ok(driver)
}

#[cfg(all(feature = "ingest-v4l2", target_os = "linux"))]
fn open_device(config: &CameraConfig) -> Result<Box<dyn CameraDriver>> {
    Ok(Box::new(V4l2Camera::open(config.clone())?))
}

#[cfg(not(all(feature = "ingest-v4l2", target_os = "linux")))]
fn open_device(config: &CameraConfig) -> Result<Box<dyn CameraDriver>> {
    Err(anyhow!(
        "cannot open {}: built without the ingest-v4l2 feature (use a stub:// device)",
        config.device
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelEncoding;

    #[test]
    fn stub_device_opens_synthetic_camera() -> Result<()> {
        let config = CameraConfig {
            device: "stub://bench".to_string(),
            force_format: true,
            buffers: 4,
        };
        let driver = open_camera(&config)?;
        assert_eq!(driver.device(), "stub://bench");
        let format = driver.format();
        assert_eq!(format.encoding, PixelEncoding::Yuyv);
        assert_eq!((format.width, format.height), (FORCED_WIDTH, FORCED_HEIGHT));
        Ok(())
    }

    #[test]
    fn too_few_buffers_rejected() {
        let config = CameraConfig {
            device: "stub://bench".to_string(),
            force_format: false,
            buffers: 1,
        };
        assert!(open_camera(&config).is_err());
    }
}
