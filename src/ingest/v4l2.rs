//! V4L2 memory-mapped streaming driver.
//!
//! Device discovery, capability and format negotiation go through the `v4l`
//! crate. Buffer management is a small mmap ring driven with raw ioctls so a
//! dequeued buffer can be loaned to another thread and queued back from there.

use anyhow::{anyhow, Context, Result};
use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::unix::fs::FileTypeExt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::format::FieldOrder;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;

use super::{CameraConfig, CameraDriver, CameraStats, FORCED_HEIGHT, FORCED_WIDTH};
use crate::frame::{CaptureHandle, DequeueError, DriverQueue, DriverSlot, MappedSlice, SlotMemory};
use crate::{FrameFormat, PixelEncoding};

/// One mmap'd driver buffer. Unmapped on drop.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; readers only take `&[u8]`.
unsafe impl Send for Mapping {}
// SAFETY: as above.
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        if rc != 0 {
            log::warn!(
                "V4l2Camera: munmap failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Mapped buffers plus the queue-back path shared with every handle.
struct MmapRing {
    handle: Arc<v4l::device::Handle>,
    maps: Vec<Arc<Mapping>>,
    loaned: Mutex<Vec<bool>>,
}

impl MmapRing {
    fn fd(&self) -> i32 {
        self.handle.fd()
    }

    fn queue_buffer(&self, index: usize) -> io::Result<()> {
        let mut buf = capture_buffer(index as u32);
        // SAFETY: `buf` is a valid v4l2_buffer for the lifetime of the call.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        }
    }

    fn on_loan(&self) -> usize {
        self.loaned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| **l)
            .count()
    }
}

impl DriverQueue for MmapRing {
    fn requeue(&self, slot: DriverSlot) -> io::Result<()> {
        {
            let mut loaned = self.loaned.lock().unwrap_or_else(PoisonError::into_inner);
            match loaned.get_mut(slot.index) {
                Some(flag) if *flag => *flag = false,
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("buffer {} returned while not on loan", slot.index),
                    ))
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unknown buffer index {}", slot.index),
                    ))
                }
            }
        }
        self.queue_buffer(slot.index)
    }
}

fn capture_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf
}

/// Camera backed by a V4L2 capture device.
pub struct V4l2Camera {
    config: CameraConfig,
    device: v4l::Device,
    format: FrameFormat,
    ring: Option<Arc<MmapRing>>,
    streaming: bool,
    frames_dequeued: u64,
    transient_errors: u64,
}

impl V4l2Camera {
    /// Open the device node and check it can stream video capture.
    pub fn open(config: CameraConfig) -> Result<Self> {
        let meta = std::fs::metadata(&config.device)
            .with_context(|| format!("cannot identify {}", config.device))?;
        if !meta.file_type().is_char_device() {
            return Err(anyhow!("{} is not a character device", config.device));
        }

        let device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let caps = device
            .query_caps()
            .with_context(|| format!("{} is not a V4L2 device", config.device))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(anyhow!("{} is not a video capture device", config.device));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(anyhow!("{} does not support streaming i/o", config.device));
        }
        log::info!(
            "V4l2Camera: connected to {} ({}, driver {})",
            config.device,
            caps.card,
            caps.driver
        );

        Ok(Self {
            config,
            device,
            format: FrameFormat::packed(FORCED_WIDTH, FORCED_HEIGHT, PixelEncoding::Yuyv),
            ring: None,
            streaming: false,
            frames_dequeued: 0,
            transient_errors: 0,
        })
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        // SAFETY: v4l2_requestbuffers is a plain C struct; all-zero is valid.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        // SAFETY: `req` outlives the call.
        unsafe {
            v4l2::ioctl(
                self.device.handle().fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut v4l2_requestbuffers as *mut c_void,
            )
        }
        .with_context(|| format!("{} does not support memory mapping", self.config.device))?;
        Ok(req.count)
    }

    fn map_buffers(&self, count: u32) -> Result<Vec<Arc<Mapping>>> {
        let fd = self.device.handle().fd();
        let mut maps = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut buf = capture_buffer(index);
            // SAFETY: `buf` outlives the call.
            unsafe {
                v4l2::ioctl(
                    fd,
                    vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut v4l2_buffer as *mut c_void,
                )
            }
            .with_context(|| format!("VIDIOC_QUERYBUF {}", index))?;
            let len = buf.length as usize;
            // SAFETY: QUERYBUF on an MMAP buffer fills the `offset` member.
            let offset = unsafe { buf.m.offset };
            // SAFETY: offset and length come from QUERYBUF for this fd.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(anyhow::Error::new(io::Error::last_os_error())
                    .context(format!("mmap buffer {}", index)));
            }
            let ptr = NonNull::new(ptr as *mut u8)
                .ok_or_else(|| anyhow!("mmap returned null for buffer {}", index))?;
            maps.push(Arc::new(Mapping { ptr, len }));
        }
        Ok(maps)
    }
}

impl CameraDriver for V4l2Camera {
    fn device(&self) -> &str {
        &self.config.device
    }

    fn negotiate_format(&mut self) -> Result<FrameFormat> {
        let mut fmt = self.device.format().context("read v4l2 format")?;
        if self.config.force_format {
            fmt.width = FORCED_WIDTH;
            fmt.height = FORCED_HEIGHT;
            fmt.fourcc = v4l::FourCC::new(b"YUYV");
            fmt.field_order = FieldOrder::Progressive;
            fmt = self
                .device
                .set_format(&fmt)
                .with_context(|| format!("set YUYV {}x{}", FORCED_WIDTH, FORCED_HEIGHT))?;
        }
        let encoding = PixelEncoding::from_fourcc(fmt.fourcc.repr);
        self.format = FrameFormat {
            width: fmt.width,
            height: fmt.height,
            encoding,
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
        }
        .sanitized();
        if encoding != PixelEncoding::Yuyv {
            log::warn!(
                "V4l2Camera: {} delivers {}, detection expects YUYV",
                self.config.device,
                encoding
            );
        }
        Ok(self.format)
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn start_streaming(&mut self) -> Result<()> {
        let count = self.request_buffers(self.config.buffers)?;
        if count < 2 {
            return Err(anyhow!(
                "insufficient buffer memory on {} ({} buffers)",
                self.config.device,
                count
            ));
        }
        let maps = self.map_buffers(count)?;
        let ring = Arc::new(MmapRing {
            handle: self.device.handle(),
            loaned: Mutex::new(vec![false; maps.len()]),
            maps,
        });
        for index in 0..ring.maps.len() {
            ring.queue_buffer(index)
                .with_context(|| format!("VIDIOC_QBUF {}", index))?;
        }
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: `typ` outlives the call.
        unsafe {
            v4l2::ioctl(
                ring.fd(),
                vidioc::VIDIOC_STREAMON,
                &mut typ as *mut u32 as *mut c_void,
            )
        }
        .context("VIDIOC_STREAMON")?;
        log::info!(
            "V4l2Camera: streaming {} with {} buffers",
            self.config.device,
            count
        );
        self.ring = Some(ring);
        self.streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: `typ` outlives the call.
        unsafe {
            v4l2::ioctl(
                self.device.handle().fd(),
                vidioc::VIDIOC_STREAMOFF,
                &mut typ as *mut u32 as *mut c_void,
            )
        }
        .context("VIDIOC_STREAMOFF")?;
        // Mappings stay alive until the last outstanding handle drops.
        self.ring = None;
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.device.handle().fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: `pfd` is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(anyhow::Error::new(err).context("poll"));
        }
        Ok(rc > 0)
    }

    fn dequeue(&mut self) -> Result<CaptureHandle, DequeueError> {
        let ring = match (&self.ring, self.streaming) {
            (Some(ring), true) => ring.clone(),
            _ => {
                return Err(DequeueError::Fatal(io::Error::new(
                    io::ErrorKind::Other,
                    "dequeue while not streaming",
                )))
            }
        };
        let mut buf = capture_buffer(0);
        // SAFETY: `buf` outlives the call.
        let rc = unsafe {
            v4l2::ioctl(
                ring.fd(),
                vidioc::VIDIOC_DQBUF,
                &mut buf as *mut v4l2_buffer as *mut c_void,
            )
        };
        if let Err(err) = rc {
            return Err(match err.raw_os_error() {
                Some(libc::EAGAIN) => DequeueError::Empty,
                Some(libc::EIO) => {
                    self.transient_errors += 1;
                    DequeueError::Transient(err)
                }
                _ => DequeueError::Fatal(err),
            });
        }

        let index = buf.index as usize;
        let Some(map) = ring.maps.get(index).cloned() else {
            return Err(DequeueError::Fatal(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("driver returned unknown buffer index {}", index),
            )));
        };
        {
            let mut loaned = ring.loaned.lock().unwrap_or_else(PoisonError::into_inner);
            loaned[index] = true;
        }
        let ptr = map.ptr;
        let len = map.len;
        // SAFETY: the mapping lives as long as the Arc held by the slice and
        // the driver does not fill this buffer until it is queued back.
        let memory = unsafe { MappedSlice::new(ptr, len, map) };
        self.frames_dequeued += 1;
        let queue: Arc<dyn DriverQueue> = ring;
        Ok(CaptureHandle::new(
            DriverSlot {
                index,
                memory: SlotMemory::Mapped(memory),
            },
            buf.bytesused as usize,
            self.format,
            u64::from(buf.sequence),
            SystemTime::now(),
            queue,
        ))
    }

    fn stats(&self) -> CameraStats {
        CameraStats {
            frames_dequeued: self.frames_dequeued,
            buffers_on_loan: self.ring.as_ref().map_or(0, |r| r.on_loan()),
            transient_errors: self.transient_errors,
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        if let Err(err) = self.stop_streaming() {
            log::warn!("V4l2Camera: stop on drop failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_rejected() {
        let config = CameraConfig {
            device: "/nonexistent/video99".to_string(),
            ..CameraConfig::default()
        };
        assert!(V4l2Camera::open(config).is_err());
    }

    #[test]
    fn regular_file_is_not_a_char_device() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let config = CameraConfig {
            device: file.path().display().to_string(),
            ..CameraConfig::default()
        };
        let err = V4l2Camera::open(config).err().context("expected error")?;
        assert!(err.to_string().contains("not a character device"));
        Ok(())
    }
}
