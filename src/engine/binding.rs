//! Engine binding: instance lifecycle plus the image export path.
//!
//! The binding is tolerant of a missing library: every operation degrades
//! to a logged safe default (`false`, `0`, empty, `None`) so a worker
//! deployed without the native engine still serves the rest of its
//! surface.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use super::api::{EngineApi, EngineInstance};
use super::frame::{export_segment, ExportedFrame, FrameStore, MAX_FRAME_BYTES};

pub struct EngineBinding {
    api: Option<Arc<dyn EngineApi>>,
    instance: Mutex<Option<EngineInstance>>,
    export_dir: PathBuf,
    store: Arc<FrameStore>,
}

impl EngineBinding {
    pub fn new(api: Option<Arc<dyn EngineApi>>, export_dir: PathBuf, store: Arc<FrameStore>) -> Self {
        if api.is_none() {
            warn!("engine library not loaded, engine operations will be no-ops");
        }
        Self {
            api,
            instance: Mutex::new(None),
            export_dir,
            store,
        }
    }

    fn api(&self) -> Option<&Arc<dyn EngineApi>> {
        if self.api.is_none() {
            warn!("engine operation skipped, library not loaded");
        }
        self.api.as_ref()
    }

    fn current(&self) -> Option<EngineInstance> {
        let instance = *self.instance.lock().unwrap();
        if instance.is_none() {
            warn!("engine operation skipped, no instance");
        }
        instance
    }

    pub fn version(&self) -> Option<String> {
        self.api().and_then(|api| api.version())
    }

    pub fn set_static_option(&self, key: i32, value: &str) -> bool {
        self.api()
            .map(|api| api.set_static_option(key, value))
            .unwrap_or(false)
    }

    pub fn set_user_dir(&self, path: &Path) -> bool {
        self.api().map(|api| api.set_user_dir(path)).unwrap_or(false)
    }

    pub fn load_resource(&self, path: &Path) -> bool {
        self.api()
            .map(|api| api.load_resource(path))
            .unwrap_or(false)
    }

    /// Create a fresh instance, tearing down any existing one first, and
    /// attach the shared frame buffer so the engine reads captures in
    /// place.
    pub fn create(&self) -> bool {
        let Some(api) = self.api() else {
            return false;
        };
        let mut slot = self.instance.lock().unwrap();
        if let Some(old) = slot.take() {
            info!("destroying previous engine instance");
            api.destroy(old);
        }
        let Some(instance) = api.create() else {
            warn!("engine instance creation failed");
            return false;
        };
        let (base, len) = self.store.raw_parts();
        if !api.attach_frame_buffer(instance, base, len) {
            warn!("engine rejected the frame buffer attachment");
        }
        *slot = Some(instance);
        info!("engine instance created");
        true
    }

    pub fn destroy(&self) {
        let Some(api) = self.api.as_ref() else {
            return;
        };
        if let Some(instance) = self.instance.lock().unwrap().take() {
            api.destroy(instance);
            info!("engine instance destroyed");
        }
    }

    pub fn set_instance_option(&self, key: i32, value: &str) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.set_instance_option(instance, key, value),
            _ => false,
        }
    }

    pub fn append_task(&self, task_type: &str, params: &str) -> i32 {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.append_task(instance, task_type, params),
            _ => 0,
        }
    }

    pub fn set_task_params(&self, task_id: i32, params: &str) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.set_task_params(instance, task_id, params),
            _ => false,
        }
    }

    pub fn task_list(&self) -> Vec<i32> {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.task_list(instance),
            _ => Vec::new(),
        }
    }

    pub fn start(&self) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.start(instance),
            _ => false,
        }
    }

    pub fn stop(&self) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.stop(instance),
            _ => false,
        }
    }

    pub fn running(&self) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.running(instance),
            _ => false,
        }
    }

    pub fn back_to_home(&self) -> bool {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.back_to_home(instance),
            _ => false,
        }
    }

    pub fn uid(&self) -> Option<String> {
        match (self.api(), self.current()) {
            (Some(api), Some(instance)) => api.uid(instance),
            _ => None,
        }
    }

    pub fn get_image(&self) -> Option<ExportedFrame> {
        self.export_image(false)
    }

    pub fn get_image_bgr(&self) -> Option<ExportedFrame> {
        self.export_image(true)
    }

    /// Pull the engine's current image and publish it as a shared-memory
    /// segment. On any failure nothing is leaked and `None` is returned.
    fn export_image(&self, bgr: bool) -> Option<ExportedFrame> {
        let (api, instance) = match (self.api(), self.current()) {
            (Some(api), Some(instance)) => (api, instance),
            _ => return None,
        };
        let cap = self
            .store
            .geometry()
            .map(|g| g.frame_bytes())
            .unwrap_or(MAX_FRAME_BYTES);
        let mut buf = vec![0u8; cap];
        let len = if bgr {
            api.get_image_bgr(instance, &mut buf)?
        } else {
            api.get_image(instance, &mut buf)?
        };
        if len == 0 {
            warn!("engine returned an empty image");
            return None;
        }
        match export_segment(&self.export_dir, &buf[..len]) {
            Ok(exported) => Some(exported),
            Err(e) => {
                warn!("image export failed: {e:#}");
                None
            }
        }
    }
}

impl Drop for EngineBinding {
    fn drop(&mut self) {
        self.destroy();
    }
}
