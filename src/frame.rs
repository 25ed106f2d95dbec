//! Driver buffer handles.
//!
//! - `CaptureHandle`: one dequeued driver buffer. Move-only; the buffer goes
//!   back to the driver exactly once, when the handle is released or dropped.
//! - `DriverQueue`: the return path into the driver. Shared by every handle
//!   the driver hands out, so any stage thread can return a buffer.
//! - `DequeueError`: how a dequeue attempt failed.

use std::any::Any;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::SystemTime;

use crate::FrameFormat;

/// Return path for driver buffers.
pub trait DriverQueue: Send + Sync {
    /// Hand `slot` back to the driver so it can be refilled.
    fn requeue(&self, slot: DriverSlot) -> io::Result<()>;
}

/// A driver buffer slot on loan to a `CaptureHandle`.
pub struct DriverSlot {
    pub index: usize,
    pub memory: SlotMemory,
}

/// Backing memory of a driver slot.
pub enum SlotMemory {
    /// Heap storage moved out of the driver for the loan.
    Owned(Box<[u8]>),
    /// Memory mapped from the device.
    Mapped(MappedSlice),
}

impl SlotMemory {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            SlotMemory::Owned(data) => data,
            SlotMemory::Mapped(map) => map.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of a device mapping, kept alive by `mapping`.
pub struct MappedSlice {
    ptr: NonNull<u8>,
    len: usize,
    _mapping: Arc<dyn Any + Send + Sync>,
}

impl MappedSlice {
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay mapped and readable for as long as `mapping`
    /// is alive, and the driver must not write it while the slot is on loan.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, mapping: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            ptr,
            len,
            _mapping: mapping,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `MappedSlice::new`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

// SAFETY: the mapping is shared read-only memory kept alive by an Arc.
unsafe impl Send for MappedSlice {}
// SAFETY: as above; only shared reads are exposed.
unsafe impl Sync for MappedSlice {}

/// Why a dequeue returned no buffer.
#[derive(Debug)]
pub enum DequeueError {
    /// No filled buffer is ready yet.
    Empty,
    /// Recoverable I/O error; retry after the next readiness wait.
    Transient(io::Error),
    /// The device cannot continue.
    Fatal(io::Error),
}

impl DequeueError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DequeueError::Fatal(_))
    }
}

impl fmt::Display for DequeueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DequeueError::Empty => f.write_str("no buffer ready"),
            DequeueError::Transient(err) => write!(f, "transient dequeue error: {}", err),
            DequeueError::Fatal(err) => write!(f, "fatal dequeue error: {}", err),
        }
    }
}

impl std::error::Error for DequeueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DequeueError::Empty => None,
            DequeueError::Transient(err) | DequeueError::Fatal(err) => Some(err),
        }
    }
}

/// One driver-owned frame buffer, on loan to the pipeline.
///
/// There is no `Clone`: at most one handle exists per driver slot.
pub struct CaptureHandle {
    slot: Option<DriverSlot>,
    bytes_used: usize,
    format: FrameFormat,
    sequence: u64,
    captured_at: SystemTime,
    queue: Arc<dyn DriverQueue>,
}

impl CaptureHandle {
    /// Wrap a dequeued slot. `bytes_used` is clamped to the slot size.
    pub fn new(
        slot: DriverSlot,
        bytes_used: usize,
        format: FrameFormat,
        sequence: u64,
        captured_at: SystemTime,
        queue: Arc<dyn DriverQueue>,
    ) -> Self {
        let bytes_used = bytes_used.min(slot.memory.len());
        Self {
            slot: Some(slot),
            bytes_used,
            format,
            sequence,
            captured_at,
            queue,
        }
    }

    /// Driver slot index.
    pub fn index(&self) -> usize {
        self.slot.as_ref().map_or(usize::MAX, |s| s.index)
    }

    /// Bytes the driver actually filled.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// The filled bytes.
    pub fn bytes(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.memory.as_slice()[..self.bytes_used],
            None => &[],
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Driver frame sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Return the buffer to the driver now, surfacing any error.
    pub fn release(mut self) -> io::Result<()> {
        self.requeue()
    }

    fn requeue(&mut self) -> io::Result<()> {
        match self.slot.take() {
            Some(slot) => self.queue.requeue(slot),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("index", &self.index())
            .field("bytes_used", &self.bytes_used)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Err(err) = self.requeue() {
            log::error!("CaptureHandle: failed to return buffer to driver: {}", err);
        }
    }
}
