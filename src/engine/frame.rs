//! Shared frame buffers
//!
//! Two memory-mapped concerns live here. The `FrameStore` is the fixed
//! capture-side buffer: the pipeline copies every produced frame into it and
//! the engine reads from it continuously once attached. Exported segments
//! are the per-retrieval handoff: `GetImage` writes the engine's current
//! frame into a fresh file-backed segment whose handle crosses the process
//! boundary, read and removed by the consumer.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::output::Geometry;

/// Largest supported frame: 3840x2160 RGBA.
pub const MAX_FRAME_BYTES: usize = 3840 * 2160 * 4;

/// Fixed-capacity frame buffer shared between the capture pipeline and the
/// engine binding. Allocated once at maximum capacity; geometry is
/// configured per capture session.
pub struct FrameStore {
    buf: Mutex<MmapMut>,
    geometry: Mutex<Option<Geometry>>,
    frame_len: AtomicUsize,
    seq: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Result<Self> {
        let buf = MmapMut::map_anon(MAX_FRAME_BYTES).context("failed to map frame store")?;
        Ok(Self {
            buf: Mutex::new(buf),
            geometry: Mutex::new(None),
            frame_len: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        })
    }

    /// Configure the store for a capture session. Fails if the geometry
    /// exceeds the fixed capacity.
    pub fn configure(&self, geometry: Geometry) -> Result<()> {
        if geometry.frame_bytes() > MAX_FRAME_BYTES {
            bail!("frame geometry {geometry} exceeds frame store capacity");
        }
        *self.geometry.lock().unwrap() = Some(geometry);
        self.frame_len.store(0, Ordering::Release);
        Ok(())
    }

    /// Detach the store from the current session. The mapping itself stays
    /// allocated for the next session.
    pub fn release(&self) {
        *self.geometry.lock().unwrap() = None;
        self.frame_len.store(0, Ordering::Release);
    }

    pub fn geometry(&self) -> Option<Geometry> {
        *self.geometry.lock().unwrap()
    }

    /// Copy one frame in, returning its sequence number. Frames larger than
    /// the configured geometry are rejected, not truncated.
    pub fn write_frame(&self, data: &[u8]) -> Result<u64> {
        let Some(geometry) = self.geometry() else {
            bail!("frame store not configured");
        };
        if data.len() > geometry.frame_bytes() {
            bail!(
                "frame of {} bytes exceeds configured geometry {geometry}",
                data.len()
            );
        }
        {
            let mut buf = self.buf.lock().unwrap();
            buf[..data.len()].copy_from_slice(data);
        }
        self.frame_len.store(data.len(), Ordering::Release);
        Ok(self.seq.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Sequence number of the newest frame; 0 before any frame arrived.
    pub fn frame_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Base pointer and capacity handed to the native engine when an
    /// instance attaches. The mapping never moves, so the pointer stays
    /// valid for the store's lifetime.
    pub fn raw_parts(&self) -> (*const u8, usize) {
        let buf = self.buf.lock().unwrap();
        (buf.as_ptr(), MAX_FRAME_BYTES)
    }

    /// Copy the newest frame out, if any.
    pub fn snapshot(&self) -> Option<(Vec<u8>, u64)> {
        let len = self.frame_len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        let buf = self.buf.lock().unwrap();
        Some((buf[..len].to_vec(), self.seq.load(Ordering::Acquire)))
    }
}

/// Handle to an exported frame segment. The consumer maps or reads the file
/// and removes it when done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedFrame {
    pub path: PathBuf,
    pub len: u64,
}

impl ExportedFrame {
    /// Read the segment contents and release it.
    pub fn consume(self) -> Result<Vec<u8>> {
        let data = std::fs::read(&self.path)
            .with_context(|| format!("failed to read frame segment {:?}", self.path))?;
        let _ = std::fs::remove_file(&self.path);
        Ok(data)
    }
}

/// Write `data` into a fresh file-backed segment under `dir`. On any
/// failure the partially created segment is removed; nothing leaks.
pub fn export_segment(dir: &Path, data: &[u8]) -> Result<ExportedFrame> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create segment directory {dir:?}"))?;
    let path = dir.join(format!("frame-{}.bin", uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("failed to create frame segment {path:?}"))?;
        file.set_len(data.len() as u64)
            .context("failed to size frame segment")?;
        let mut map = unsafe { MmapMut::map_mut(&file) }.context("failed to map frame segment")?;
        map.copy_from_slice(data);
        map.flush().context("failed to flush frame segment")?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(ExportedFrame {
            path,
            len: data.len() as u64,
        }),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_frame_requires_configuration() {
        let store = FrameStore::new().unwrap();
        assert!(store.write_frame(&[0u8; 16]).is_err());

        store.configure(Geometry::new(2, 2, 160)).unwrap();
        let seq = store.write_frame(&[7u8; 16]).unwrap();
        assert_eq!(seq, 1);
        let (data, seq) = store.snapshot().unwrap();
        assert_eq!(data, vec![7u8; 16]);
        assert_eq!(seq, 1);
    }

    #[test]
    fn release_clears_session_state() {
        let store = FrameStore::new().unwrap();
        store.configure(Geometry::new(2, 2, 160)).unwrap();
        store.write_frame(&[1u8; 16]).unwrap();

        store.release();
        assert!(store.geometry().is_none());
        assert!(store.snapshot().is_none());
        assert!(store.write_frame(&[1u8; 16]).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let store = FrameStore::new().unwrap();
        store.configure(Geometry::new(2, 2, 160)).unwrap();
        assert!(store.write_frame(&[0u8; 17]).is_err());
    }

    #[test]
    fn export_segment_round_trip() {
        let dir = std::env::temp_dir().join(format!("spx-test-{}", uuid::Uuid::new_v4()));
        let exported = export_segment(&dir, b"frame bytes").unwrap();
        assert_eq!(exported.len, 11);
        let path = exported.path.clone();
        assert_eq!(exported.consume().unwrap(), b"frame bytes");
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
