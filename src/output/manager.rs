//! Virtual output managers
//!
//! Both strategies share one Idle/Capturing state machine with
//! compare-and-set transitions: concurrent starts coalesce onto a single
//! session, stop on an idle manager is a no-op, and restart is a
//! Capturing-to-Capturing shortcut serialized by a dedicated lock so a
//! listener callback and an explicit call cannot tear down the same
//! session twice.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::FrameStore;

use super::pipeline::{CapturePipeline, PreviewSink, PreviewSlot};
use super::platform::{OutputDevice, OutputPlatform};
use super::{Geometry, OUTPUT_NONE};

/// Logical id of the primary output.
pub const PRIMARY_OUTPUT_ID: i32 = 0;

const OUTPUT_NAME: &str = "spx_output";

struct ActiveSession {
    pipeline: CapturePipeline,
    device: OutputDevice,
}

/// Creates a standalone off-screen output at a configured resolution.
pub struct SurrogateOutputManager {
    platform: Arc<dyn OutputPlatform>,
    store: Arc<FrameStore>,
    preview: PreviewSlot,
    preview_interval: Duration,
    capturing: AtomicBool,
    config: Mutex<Geometry>,
    output_id: AtomicI32,
    session: Mutex<Option<ActiveSession>>,
    restart_lock: Mutex<()>,
}

impl SurrogateOutputManager {
    pub fn new(
        platform: Arc<dyn OutputPlatform>,
        store: Arc<FrameStore>,
        config: Geometry,
        preview_interval: Duration,
    ) -> Self {
        Self {
            platform,
            store,
            preview: Arc::new(Mutex::new(None)),
            preview_interval,
            capturing: AtomicBool::new(false),
            config: Mutex::new(config),
            output_id: AtomicI32::new(OUTPUT_NONE),
            session: Mutex::new(None),
            restart_lock: Mutex::new(()),
        }
    }

    /// Replace the preview sink, releasing the previous one.
    pub fn set_preview(&self, sink: Option<Box<dyn PreviewSink>>) {
        let old = {
            let mut slot = self.preview.lock().unwrap();
            std::mem::replace(&mut *slot, sink)
        };
        if old.is_some() {
            debug!("previous preview sink released");
        }
    }

    /// Start capturing. Returns the output id; if already capturing, the
    /// existing session's id without creating a duplicate pipeline.
    pub fn start(&self) -> i32 {
        if self
            .capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("start: already capturing");
            return self.output_id.load(Ordering::Acquire);
        }
        self.start_internal()
    }

    pub fn stop(&self) {
        if self
            .capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.release_resources();
        self.set_preview(None);
        info!("surrogate output stopped");
    }

    /// Release-then-recreate shortcut; a no-op unless capturing. Only one
    /// restart may execute at a time.
    pub fn restart(&self) {
        let _guard = self.restart_lock.lock().unwrap();
        if !self.capturing.load(Ordering::Acquire) {
            return;
        }
        self.release_resources();
        self.start_internal();
    }

    /// Update the configured resolution. Triggers an implicit restart only
    /// while capturing and only when the values actually differ; while idle
    /// the pending configuration is updated without side effects.
    pub fn set_resolution(&self, width: u32, height: u32, dpi: u32) {
        let new = Geometry::new(width, height, dpi);
        let old = {
            let mut config = self.config.lock().unwrap();
            std::mem::replace(&mut *config, new)
        };
        if self.capturing.load(Ordering::Acquire) && old != new {
            info!("resolution changed: {old} -> {new}, restarting");
            self.restart();
        }
    }

    pub fn output_id(&self) -> i32 {
        self.output_id.load(Ordering::Acquire)
    }

    fn start_internal(&self) -> i32 {
        let config = *self.config.lock().unwrap();
        match self.try_start(config) {
            Ok(id) => {
                info!("surrogate output started, id={id}, {config}");
                id
            }
            Err(e) => {
                warn!("surrogate output start failed: {e:#}");
                self.release_resources();
                self.capturing.store(false, Ordering::Release);
                OUTPUT_NONE
            }
        }
    }

    fn try_start(&self, config: Geometry) -> anyhow::Result<i32> {
        self.store.configure(config)?;
        let device = match self.platform.create_output(OUTPUT_NAME, config) {
            Ok(device) => device,
            Err(primary_err) => {
                warn!("primary output API failed, trying layer API: {primary_err:#}");
                self.platform.create_layer_output(OUTPUT_NAME, config)?
            }
        };
        let producer = match self.platform.producer_for(&device) {
            Ok(producer) => producer,
            Err(e) => {
                self.platform.destroy_output(&device);
                return Err(e);
            }
        };
        let pipeline = match CapturePipeline::spawn(
            "surrogate-capture",
            producer,
            self.store.clone(),
            self.preview.clone(),
            self.preview_interval,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.platform.destroy_output(&device);
                return Err(e);
            }
        };
        let id = device.id;
        *self.session.lock().unwrap() = Some(ActiveSession { pipeline, device });
        self.output_id.store(id, Ordering::Release);
        Ok(id)
    }

    /// Release in order: surface producer first, then the output device.
    /// The preview sink survives restarts; only an explicit stop drops it.
    fn release_resources(&self) {
        if let Some(mut session) = self.session.lock().unwrap().take() {
            session.pipeline.stop();
            self.platform.destroy_output(&session.device);
        }
        self.output_id.store(OUTPUT_NONE, Ordering::Release);
        self.store.release();
    }
}

impl Drop for SurrogateOutputManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Mirrors the primary physical output, restarting the pipeline whenever
/// the output's geometry changes.
pub struct PrimaryOutputManager {
    platform: Arc<dyn OutputPlatform>,
    store: Arc<FrameStore>,
    preview_interval: Duration,
    capturing: AtomicBool,
    observed: Mutex<Option<Geometry>>,
    session: Mutex<Option<ActiveSession>>,
    restart_lock: Mutex<()>,
    listener_started: AtomicBool,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl PrimaryOutputManager {
    pub fn new(
        platform: Arc<dyn OutputPlatform>,
        store: Arc<FrameStore>,
        preview_interval: Duration,
    ) -> Self {
        Self::with_poll_interval(platform, store, preview_interval, Duration::from_millis(500))
    }

    pub fn with_poll_interval(
        platform: Arc<dyn OutputPlatform>,
        store: Arc<FrameStore>,
        preview_interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            platform,
            store,
            preview_interval,
            capturing: AtomicBool::new(false),
            observed: Mutex::new(None),
            session: Mutex::new(None),
            restart_lock: Mutex::new(()),
            listener_started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_interval,
        }
    }

    pub fn start(self: &Arc<Self>) -> i32 {
        self.ensure_listener();
        if self
            .capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("start: already capturing");
            return PRIMARY_OUTPUT_ID;
        }
        self.start_internal();
        PRIMARY_OUTPUT_ID
    }

    pub fn stop(&self) {
        if self
            .capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.release_resources();
        info!("primary output capture stopped");
    }

    pub fn restart(&self) {
        let _guard = self.restart_lock.lock().unwrap();
        if !self.capturing.load(Ordering::Acquire) {
            return;
        }
        self.release_resources();
        self.start_internal();
    }

    pub fn output_id(&self) -> i32 {
        PRIMARY_OUTPUT_ID
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    /// Shut down the geometry listener thread. Called on worker teardown.
    pub fn shutdown_listener(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn start_internal(&self) {
        let geometry = self.platform.primary_geometry();
        *self.observed.lock().unwrap() = Some(geometry);

        if let Err(e) = self.store.configure(geometry) {
            warn!("primary capture start failed: {e:#}");
            self.capturing.store(false, Ordering::Release);
            return;
        }

        let device = match self.platform.create_output(OUTPUT_NAME, geometry) {
            Ok(device) => {
                debug!("output created via primary display API");
                device
            }
            Err(primary_err) => match self.platform.create_layer_output(OUTPUT_NAME, geometry) {
                Ok(device) => {
                    debug!("output created via layer API");
                    device
                }
                Err(layer_err) => {
                    // No output device means capture cannot proceed at
                    // all. Leave the state machine consistent before the
                    // fatal unwind; the worker escalates the panic into a
                    // process death the controller observes.
                    self.store.release();
                    self.capturing.store(false, Ordering::Release);
                    panic!(
                        "could not create output device (primary: {primary_err:#}, layer: {layer_err:#})"
                    );
                }
            },
        };

        let producer = match self.platform.producer_for(&device) {
            Ok(producer) => producer,
            Err(e) => {
                warn!("primary capture producer failed: {e:#}");
                self.platform.destroy_output(&device);
                self.capturing.store(false, Ordering::Release);
                return;
            }
        };

        match CapturePipeline::spawn(
            "primary-capture",
            producer,
            self.store.clone(),
            Arc::new(Mutex::new(None)),
            self.preview_interval,
        ) {
            Ok(pipeline) => {
                *self.session.lock().unwrap() = Some(ActiveSession { pipeline, device });
                info!("primary output capture started, {geometry}");
            }
            Err(e) => {
                warn!("primary capture pipeline failed: {e:#}");
                self.platform.destroy_output(&device);
                self.capturing.store(false, Ordering::Release);
            }
        }
    }

    fn release_resources(&self) {
        if let Some(mut session) = self.session.lock().unwrap().take() {
            session.pipeline.stop();
            self.platform.destroy_output(&session.device);
        }
        self.store.release();
    }

    /// Spawn the geometry listener thread once. It polls the primary
    /// output and restarts the pipeline whenever the size changes.
    fn ensure_listener(self: &Arc<Self>) {
        if self
            .listener_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        let poll = self.poll_interval;
        let shutdown = self.shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name("output-listener".to_string())
            .spawn(move || loop {
                std::thread::sleep(poll);
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let current = manager.platform.primary_geometry();
                let changed = {
                    let mut observed = manager.observed.lock().unwrap();
                    match *observed {
                        Some(old) if old != current => {
                            info!("primary output changed: {old} -> {current}");
                            *observed = Some(current);
                            true
                        }
                        None => {
                            *observed = Some(current);
                            false
                        }
                        _ => false,
                    }
                };
                if changed {
                    // A panic on this thread would otherwise die silently
                    // and leave a half-torn-down capture behind.
                    let restarted =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            manager.restart()
                        }));
                    if restarted.is_err() {
                        std::process::abort();
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn output listener: {e}");
            self.listener_started.store(false, Ordering::Release);
        }
    }
}

impl Drop for PrimaryOutputManager {
    fn drop(&mut self) {
        self.shutdown_listener();
        if self
            .capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.release_resources();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::HeadlessPlatform;
    use std::time::Instant;

    fn surrogate(platform: Arc<HeadlessPlatform>) -> SurrogateOutputManager {
        let store = Arc::new(FrameStore::new().unwrap());
        SurrogateOutputManager::new(
            platform,
            store,
            Geometry::new(64, 64, 160),
            Duration::from_millis(33),
        )
    }

    #[test]
    fn concurrent_starts_coalesce_to_one_session() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = Arc::new(surrogate(platform.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = manager.clone();
            handles.push(std::thread::spawn(move || m.start()));
        }
        let ids: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids[0] != OUTPUT_NONE);
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(platform.live_outputs(), 1);
        manager.stop();
        assert_eq!(platform.live_outputs(), 0);
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());
        manager.stop();
        assert_eq!(manager.output_id(), OUTPUT_NONE);
        assert_eq!(platform.live_outputs(), 0);
    }

    #[test]
    fn restart_when_idle_is_a_noop() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());
        manager.restart();
        assert_eq!(platform.live_outputs(), 0);
    }

    #[test]
    fn start_after_stop_yields_fresh_session() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());

        let first = manager.start();
        manager.stop();
        assert_eq!(platform.live_outputs(), 0);

        let second = manager.start();
        assert_ne!(second, OUTPUT_NONE);
        assert_ne!(first, second);
        assert_eq!(platform.live_outputs(), 1);
        manager.stop();
    }

    #[test]
    fn set_resolution_while_idle_only_updates_config() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());

        manager.set_resolution(320, 240, 120);
        assert_eq!(platform.live_outputs(), 0);

        manager.start();
        let store_geometry = manager.store.geometry().unwrap();
        assert_eq!(store_geometry, Geometry::new(320, 240, 120));
        manager.stop();
    }

    #[test]
    fn set_resolution_while_capturing_restarts_with_new_geometry() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());

        let first = manager.start();
        manager.set_resolution(128, 128, 160);
        assert_eq!(manager.store.geometry().unwrap(), Geometry::new(128, 128, 160));
        assert_ne!(manager.output_id(), first);
        assert_eq!(platform.live_outputs(), 1);
        manager.stop();
    }

    #[test]
    fn set_resolution_with_identical_values_does_not_restart() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let manager = surrogate(platform.clone());

        let id = manager.start();
        manager.set_resolution(64, 64, 160);
        assert_eq!(manager.output_id(), id);
        manager.stop();
    }

    #[test]
    fn surrogate_falls_back_to_layer_api() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        platform.set_primary_api_supported(false);
        let manager = surrogate(platform.clone());

        assert_ne!(manager.start(), OUTPUT_NONE);
        assert_eq!(platform.live_outputs(), 1);
        manager.stop();
    }

    #[test]
    fn surrogate_double_creation_failure_resets_state() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        platform.set_primary_api_supported(false);
        platform.set_layer_api_supported(false);
        let manager = surrogate(platform.clone());

        assert_eq!(manager.start(), OUTPUT_NONE);
        assert_eq!(manager.output_id(), OUTPUT_NONE);
        assert_eq!(platform.live_outputs(), 0);

        // The failed start left the manager idle; it can start again once
        // output creation works.
        platform.set_primary_api_supported(true);
        platform.set_layer_api_supported(true);
        assert_ne!(manager.start(), OUTPUT_NONE);
        manager.stop();
    }

    #[test]
    #[should_panic(expected = "could not create output device")]
    fn primary_double_creation_failure_is_fatal() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        platform.set_primary_api_supported(false);
        platform.set_layer_api_supported(false);
        let store = Arc::new(FrameStore::new().unwrap());
        let manager = Arc::new(PrimaryOutputManager::with_poll_interval(
            platform,
            store,
            Duration::from_millis(33),
            Duration::from_secs(60),
        ));
        manager.start();
    }

    #[test]
    fn primary_double_creation_failure_leaves_capturing_false() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        platform.set_primary_api_supported(false);
        platform.set_layer_api_supported(false);
        let store = Arc::new(FrameStore::new().unwrap());
        let manager = Arc::new(PrimaryOutputManager::with_poll_interval(
            platform.clone(),
            store.clone(),
            Duration::from_millis(33),
            Duration::from_secs(60),
        ));

        let unwound = {
            let manager = manager.clone();
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || manager.start()))
        };
        assert!(unwound.is_err());
        assert!(!manager.is_capturing());
        assert!(store.geometry().is_none());
        manager.shutdown_listener();
    }

    #[test]
    fn primary_geometry_change_is_polled_into_store() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let store = Arc::new(FrameStore::new().unwrap());
        let manager = Arc::new(PrimaryOutputManager::with_poll_interval(
            platform.clone(),
            store.clone(),
            Duration::from_millis(33),
            Duration::from_millis(10),
        ));

        assert_eq!(manager.start(), PRIMARY_OUTPUT_ID);
        assert_eq!(store.geometry().unwrap(), Geometry::new(1280, 720, 240));

        platform.set_primary_geometry(Geometry::new(1920, 1080, 240));
        let deadline = Instant::now() + Duration::from_secs(2);
        while store.geometry() != Some(Geometry::new(1920, 1080, 240)) && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(store.geometry().unwrap(), Geometry::new(1920, 1080, 240));
        assert_eq!(manager.output_id(), PRIMARY_OUTPUT_ID);
        assert!(manager.is_capturing());
        manager.stop();
        manager.shutdown_listener();
    }

    #[test]
    fn primary_stop_then_start_recovers() {
        let platform = Arc::new(HeadlessPlatform::new(Geometry::new(1280, 720, 240)));
        let store = Arc::new(FrameStore::new().unwrap());
        let manager = Arc::new(PrimaryOutputManager::with_poll_interval(
            platform.clone(),
            store,
            Duration::from_millis(33),
            Duration::from_millis(50),
        ));

        manager.start();
        manager.stop();
        assert_eq!(platform.live_outputs(), 0);
        manager.start();
        assert_eq!(platform.live_outputs(), 1);
        manager.stop();
        manager.shutdown_listener();
    }
}
