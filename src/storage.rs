//! Image sinks for persisted frames.
//!
//! Frames are written as binary PPM (`P6`). The header carries the capture
//! wall-clock time as a comment, which downstream tooling parses, so its
//! layout is fixed:
//!
//! ```text
//! P6
//! #<secs, 10 digits> sec <millis, 10 digits> msec
//!  <width> <height>
//! 255
//! ```

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::WallTime;

/// One frame to persist. Pixels are packed RGB24.
#[derive(Clone, Copy, Debug)]
pub struct ImageRecord<'a> {
    pub sequence: u64,
    pub timestamp: WallTime,
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

impl ImageRecord<'_> {
    fn expected_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 3
    }
}

/// Why an image was not stored.
#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    /// Fewer bytes reached storage than were written.
    ShortWrite { expected: u64, written: u64 },
    /// Pixel count does not match the stated dimensions.
    InvalidImage { expected: u64, actual: u64 },
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(err) => write!(f, "image write failed: {}", err),
            SinkError::ShortWrite { expected, written } => {
                write!(f, "short image write: {} of {} bytes", written, expected)
            }
            SinkError::InvalidImage { expected, actual } => write!(
                f,
                "pixel data is {} bytes, dimensions need {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SinkError {
    fn from(err: io::Error) -> Self {
        SinkError::Io(err)
    }
}

/// Destination for persisted frames.
pub trait ImageSink: Send {
    /// Store one image; returns the total bytes written, header included.
    fn write_image(&mut self, record: &ImageRecord<'_>) -> Result<u64, SinkError>;
}

impl<S: ImageSink + ?Sized> ImageSink for Box<S> {
    fn write_image(&mut self, record: &ImageRecord<'_>) -> Result<u64, SinkError> {
        (**self).write_image(record)
    }
}

/// PPM header for an RGB image.
pub fn ppm_header(timestamp: WallTime, width: u32, height: u32) -> String {
    format!(
        "P6\n#{:010} sec {:010} msec \n {} {} \n255\n",
        timestamp.secs, timestamp.millis, width, height
    )
}

fn check_record(record: &ImageRecord<'_>) -> Result<(), SinkError> {
    let actual = record.pixels.len() as u64;
    let expected = record.expected_len();
    if actual != expected {
        return Err(SinkError::InvalidImage { expected, actual });
    }
    Ok(())
}

/// Writes `<dir>/<prefix><sequence:04>.ppm` files.
pub struct FilesystemSink {
    dir: PathBuf,
    prefix: String,
}

impl FilesystemSink {
    /// Create `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}{:04}.ppm", self.prefix, sequence))
    }
}

impl ImageSink for FilesystemSink {
    fn write_image(&mut self, record: &ImageRecord<'_>) -> Result<u64, SinkError> {
        check_record(record)?;
        let header = ppm_header(record.timestamp, record.width, record.height);
        let expected = header.len() as u64 + record.pixels.len() as u64;

        let path = self.path_for(record.sequence);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(header.as_bytes())?;
            file.write_all(record.pixels)?;
            file.sync_all()?;
            let written = file.metadata()?.len();
            if written != expected {
                return Err(SinkError::ShortWrite { expected, written });
            }
        }
        fs::rename(&tmp_path, &path)?;
        log::debug!(
            "FilesystemSink: wrote {} ({} bytes)",
            path.display(),
            expected
        );
        Ok(expected)
    }
}

/// An image kept by `MemorySink`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredImage {
    pub sequence: u64,
    pub timestamp: WallTime,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Keeps encoded images in memory. Clones share the same store.
#[derive(Clone, Default)]
pub struct MemorySink {
    images: Arc<Mutex<Vec<StoredImage>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn images(&self) -> Vec<StoredImage> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageSink for MemorySink {
    fn write_image(&mut self, record: &ImageRecord<'_>) -> Result<u64, SinkError> {
        check_record(record)?;
        let mut bytes = ppm_header(record.timestamp, record.width, record.height).into_bytes();
        bytes.extend_from_slice(record.pixels);
        let written = bytes.len() as u64;
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredImage {
                sequence: record.sequence,
                timestamp: record.timestamp,
                width: record.width,
                height: record.height,
                bytes,
            });
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stamp() -> WallTime {
        WallTime {
            secs: 1_650_000_000,
            millis: 42,
        }
    }

    #[test]
    fn header_layout_is_fixed() {
        assert_eq!(
            ppm_header(stamp(), 640, 480),
            "P6\n#1650000000 sec 0000000042 msec \n 640 480 \n255\n"
        );
        let early = WallTime { secs: 7, millis: 999 };
        assert_eq!(
            ppm_header(early, 2, 1),
            "P6\n#0000000007 sec 0000000999 msec \n 2 1 \n255\n"
        );
    }

    #[test]
    fn filesystem_sink_writes_header_and_pixels() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sink = FilesystemSink::new(dir.path().join("frames"), "test")?;
        let pixels = [10u8, 20, 30, 40, 50, 60];
        let written = sink.write_image(&ImageRecord {
            sequence: 3,
            timestamp: stamp(),
            width: 2,
            height: 1,
            pixels: &pixels,
        })?;

        let path = dir.path().join("frames").join("test0003.ppm");
        let bytes = fs::read(&path)?;
        assert_eq!(bytes.len() as u64, written);
        let header = ppm_header(stamp(), 2, 1);
        assert!(bytes.starts_with(header.as_bytes()));
        assert_eq!(&bytes[header.len()..], &pixels);
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn wrong_pixel_count_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sink = FilesystemSink::new(dir.path(), "test")?;
        let err = sink
            .write_image(&ImageRecord {
                sequence: 1,
                timestamp: stamp(),
                width: 2,
                height: 2,
                pixels: &[0u8; 5],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            SinkError::InvalidImage {
                expected: 12,
                actual: 5
            }
        ));
        assert!(!sink.path_for(1).exists());
        Ok(())
    }

    #[test]
    fn memory_sink_shares_store_across_clones() -> Result<()> {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_image(&ImageRecord {
            sequence: 1,
            timestamp: stamp(),
            width: 1,
            height: 1,
            pixels: &[1, 2, 3],
        })?;
        let images = sink.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].sequence, 1);
        assert!(images[0].bytes.ends_with(&[1, 2, 3]));
        Ok(())
    }
}
