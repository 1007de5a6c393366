//! Platform output boundary
//!
//! Everything the output managers need from the underlying display stack:
//! primary-output geometry, virtual-output creation (a primary API plus a
//! low-level layer fallback), and a non-blocking newest-frame producer.
//! The headless implementation backs tests and engine-less operation by
//! synthesizing frames in memory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use super::Geometry;

/// One captured frame, RGBA, tightly packed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub geometry: Geometry,
    pub data: Vec<u8>,
}

/// Non-blocking newest-frame acquisition bound to an output surface.
///
/// `acquire_latest` must never block: it returns `None` when no new frame
/// is pending so the capture thread can keep polling.
pub trait FrameProducer: Send {
    fn acquire_latest(&mut self) -> Result<Option<Frame>>;
}

/// An off-screen output device wired to a capture surface.
#[derive(Debug)]
pub struct OutputDevice {
    pub id: i32,
    pub geometry: Geometry,
}

/// The display-stack capability the output managers are built on.
pub trait OutputPlatform: Send + Sync {
    /// Current geometry of the primary physical output.
    fn primary_geometry(&self) -> Geometry;

    /// Force (or clear) a size override on the primary output.
    fn set_forced_primary_size(&self, size: Option<(u32, u32)>) -> bool;

    /// Create an output device through the primary platform API.
    fn create_output(&self, name: &str, geometry: Geometry) -> Result<OutputDevice>;

    /// Create an output device through the low-level layer API. Used as a
    /// fallback when `create_output` is unsupported.
    fn create_layer_output(&self, name: &str, geometry: Geometry) -> Result<OutputDevice>;

    /// Release an output device. Must be idempotent.
    fn destroy_output(&self, device: &OutputDevice);

    /// Bind a frame producer to the device's capture surface.
    fn producer_for(&self, device: &OutputDevice) -> Result<Box<dyn FrameProducer>>;
}

/// In-memory display stack: synthesizes frames instead of talking to real
/// display hardware.
pub struct HeadlessPlatform {
    primary: Mutex<Geometry>,
    forced: Mutex<Option<(u32, u32)>>,
    next_id: AtomicI32,
    live: Mutex<HashSet<i32>>,
    /// When false, `create_output` reports unsupported so callers exercise
    /// the layer fallback.
    primary_api_supported: AtomicBool,
    /// When false, `create_layer_output` fails too, for double-failure
    /// scenarios.
    layer_api_supported: AtomicBool,
    frame_interval: Duration,
}

impl HeadlessPlatform {
    pub fn new(primary: Geometry) -> Self {
        Self {
            primary: Mutex::new(primary),
            forced: Mutex::new(None),
            next_id: AtomicI32::new(2),
            live: Mutex::new(HashSet::new()),
            primary_api_supported: AtomicBool::new(true),
            layer_api_supported: AtomicBool::new(true),
            frame_interval: Duration::from_millis(15),
        }
    }

    /// Replace the reported primary geometry (simulates a display change).
    pub fn set_primary_geometry(&self, geometry: Geometry) {
        *self.primary.lock().unwrap() = geometry;
    }

    pub fn set_primary_api_supported(&self, supported: bool) {
        self.primary_api_supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_layer_api_supported(&self, supported: bool) {
        self.layer_api_supported.store(supported, Ordering::SeqCst);
    }

    /// Number of output devices currently alive.
    pub fn live_outputs(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn allocate(&self, geometry: Geometry) -> OutputDevice {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id);
        OutputDevice { id, geometry }
    }
}

impl OutputPlatform for HeadlessPlatform {
    fn primary_geometry(&self) -> Geometry {
        let base = *self.primary.lock().unwrap();
        match *self.forced.lock().unwrap() {
            Some((w, h)) => Geometry::new(w, h, base.dpi),
            None => base,
        }
    }

    fn set_forced_primary_size(&self, size: Option<(u32, u32)>) -> bool {
        *self.forced.lock().unwrap() = size;
        true
    }

    fn create_output(&self, _name: &str, geometry: Geometry) -> Result<OutputDevice> {
        if !self.primary_api_supported.load(Ordering::SeqCst) {
            bail!("output creation not supported by the primary display API");
        }
        Ok(self.allocate(geometry))
    }

    fn create_layer_output(&self, _name: &str, geometry: Geometry) -> Result<OutputDevice> {
        if !self.layer_api_supported.load(Ordering::SeqCst) {
            bail!("output creation not supported by the layer API");
        }
        Ok(self.allocate(geometry))
    }

    fn destroy_output(&self, device: &OutputDevice) {
        self.live.lock().unwrap().remove(&device.id);
    }

    fn producer_for(&self, device: &OutputDevice) -> Result<Box<dyn FrameProducer>> {
        Ok(Box::new(SyntheticProducer {
            geometry: device.geometry,
            counter: AtomicU64::new(0),
            last: None,
            interval: self.frame_interval,
        }))
    }
}

/// Produces a flat test frame at a bounded rate.
struct SyntheticProducer {
    geometry: Geometry,
    counter: AtomicU64,
    last: Option<Instant>,
    interval: Duration,
}

impl FrameProducer for SyntheticProducer {
    fn acquire_latest(&mut self) -> Result<Option<Frame>> {
        let now = Instant::now();
        if let Some(last) = self.last {
            if now.duration_since(last) < self.interval {
                return Ok(None);
            }
        }
        self.last = Some(now);
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let fill = (n % 251) as u8;
        Ok(Some(Frame {
            geometry: self.geometry,
            data: vec![fill; self.geometry.frame_bytes()],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_size_overrides_primary_geometry() {
        let platform = HeadlessPlatform::new(Geometry::new(1280, 720, 240));
        assert_eq!(platform.primary_geometry(), Geometry::new(1280, 720, 240));

        assert!(platform.set_forced_primary_size(Some((1920, 1080))));
        assert_eq!(platform.primary_geometry(), Geometry::new(1920, 1080, 240));

        assert!(platform.set_forced_primary_size(None));
        assert_eq!(platform.primary_geometry(), Geometry::new(1280, 720, 240));
    }

    #[test]
    fn primary_api_failure_leaves_layer_fallback() {
        let platform = HeadlessPlatform::new(Geometry::new(1280, 720, 240));
        platform.set_primary_api_supported(false);

        let geometry = Geometry::new(640, 360, 160);
        assert!(platform.create_output("test", geometry).is_err());
        let device = platform.create_layer_output("test", geometry).unwrap();
        assert_eq!(platform.live_outputs(), 1);
        platform.destroy_output(&device);
        assert_eq!(platform.live_outputs(), 0);
    }

    #[test]
    fn synthetic_producer_never_blocks() {
        let platform = HeadlessPlatform::new(Geometry::new(64, 64, 160));
        let device = platform
            .create_output("test", Geometry::new(64, 64, 160))
            .unwrap();
        let mut producer = platform.producer_for(&device).unwrap();

        let frame = producer.acquire_latest().unwrap().expect("first frame");
        assert_eq!(frame.data.len(), 64 * 64 * 4);
        // Immediately after a frame the producer reports nothing pending.
        assert!(producer.acquire_latest().unwrap().is_none());
    }
}
