//! Frame capture pipeline
//!
//! A dedicated capture thread polls the frame producer without blocking,
//! copies every produced frame into the shared frame store, and forwards
//! throttled frames to an optional preview sink. Producer errors drop the
//! current frame and keep the pipeline running.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::engine::FrameStore;

use super::{Frame, FrameProducer};

/// External rendering target for throttled preview frames.
pub trait PreviewSink: Send {
    fn render(&mut self, frame: &Frame) -> Result<()>;
}

/// Shared slot holding the current preview sink. Replacing the sink drops
/// (releases) the previous one.
pub type PreviewSlot = Arc<Mutex<Option<Box<dyn PreviewSink>>>>;

/// Writes the newest frame over a file or FIFO supplied by the controller.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to open preview sink {path:?}"))?;
        Ok(Self { path, file })
    }
}

impl PreviewSink for FileSink {
    fn render(&mut self, frame: &Frame) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&frame.data))
            .and_then(|_| self.file.set_len(frame.data.len() as u64))
            .with_context(|| format!("failed to write preview frame to {:?}", self.path))
    }
}

/// How long the capture thread sleeps when no frame is pending.
const IDLE_POLL: Duration = Duration::from_millis(2);

/// One running capture session: the thread plus its stop flag.
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Spawn the capture thread. The producer is owned by the thread and
    /// released when it exits.
    pub fn spawn(
        name: &str,
        mut producer: Box<dyn FrameProducer>,
        store: Arc<FrameStore>,
        preview: PreviewSlot,
        preview_interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut last_preview: Option<Instant> = None;
                while flag.load(Ordering::Acquire) {
                    let frame = match producer.acquire_latest() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            std::thread::sleep(IDLE_POLL);
                            continue;
                        }
                        Err(e) => {
                            // Transient producer error: drop the frame.
                            warn!("frame acquisition failed: {e:#}");
                            continue;
                        }
                    };

                    if let Err(e) = store.write_frame(&frame.data) {
                        warn!("frame store rejected frame: {e:#}");
                        continue;
                    }

                    let now = Instant::now();
                    let due = last_preview
                        .map(|t| now.duration_since(t) >= preview_interval)
                        .unwrap_or(true);
                    if due {
                        let mut slot = preview.lock().unwrap();
                        if let Some(sink) = slot.as_mut() {
                            if let Err(e) = sink.render(&frame) {
                                warn!("preview render failed: {e:#}");
                            }
                            last_preview = Some(now);
                        }
                    }
                }
                debug!("capture thread exiting");
            })
            .context("failed to spawn capture thread")?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the thread and release the producer. Safe to call once; the
    /// pipeline is consumed by value through `Drop` when the session ends.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Geometry;

    struct CountingProducer {
        geometry: Geometry,
        produced: u64,
        fail_on: Option<u64>,
    }

    impl FrameProducer for CountingProducer {
        fn acquire_latest(&mut self) -> Result<Option<Frame>> {
            self.produced += 1;
            if Some(self.produced) == self.fail_on {
                anyhow::bail!("synthetic producer error");
            }
            Ok(Some(Frame {
                geometry: self.geometry,
                data: vec![self.produced as u8; self.geometry.frame_bytes()],
            }))
        }
    }

    struct CountingSink {
        rendered: Arc<AtomicBool>,
    }

    impl PreviewSink for CountingSink {
        fn render(&mut self, _frame: &Frame) -> Result<()> {
            self.rendered.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn frames_flow_into_store_and_preview() {
        let geometry = Geometry::new(4, 4, 160);
        let store = Arc::new(FrameStore::new().unwrap());
        store.configure(geometry).unwrap();

        let rendered = Arc::new(AtomicBool::new(false));
        let preview: PreviewSlot = Arc::new(Mutex::new(Some(Box::new(CountingSink {
            rendered: rendered.clone(),
        }) as Box<dyn PreviewSink>)));

        let producer = Box::new(CountingProducer {
            geometry,
            produced: 0,
            fail_on: None,
        });
        let mut pipeline = CapturePipeline::spawn(
            "test-capture",
            producer,
            store.clone(),
            preview,
            Duration::from_millis(1),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.frame_seq() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.stop();

        assert!(store.frame_seq() >= 3);
        assert!(rendered.load(Ordering::SeqCst));
    }

    #[test]
    fn producer_error_drops_frame_without_stopping() {
        let geometry = Geometry::new(4, 4, 160);
        let store = Arc::new(FrameStore::new().unwrap());
        store.configure(geometry).unwrap();
        let preview: PreviewSlot = Arc::new(Mutex::new(None));

        let producer = Box::new(CountingProducer {
            geometry,
            produced: 0,
            fail_on: Some(2),
        });
        let mut pipeline = CapturePipeline::spawn(
            "test-capture",
            producer,
            store.clone(),
            preview,
            Duration::from_millis(33),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.frame_seq() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pipeline.stop();

        // Frames after the failed one still arrived.
        assert!(store.frame_seq() >= 4);
    }

    #[test]
    fn stop_is_idempotent() {
        let geometry = Geometry::new(4, 4, 160);
        let store = Arc::new(FrameStore::new().unwrap());
        store.configure(geometry).unwrap();
        let preview: PreviewSlot = Arc::new(Mutex::new(None));

        let producer = Box::new(CountingProducer {
            geometry,
            produced: 0,
            fail_on: None,
        });
        let mut pipeline =
            CapturePipeline::spawn("test-capture", producer, store, preview, Duration::from_millis(33))
                .unwrap();
        pipeline.stop();
        pipeline.stop();
    }
}
