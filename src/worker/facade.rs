//! The worker-side control facade.
//!
//! One object owns everything the privileged process manages: the engine
//! binding, both output managers, permission grants, and the forced-size
//! recovery marker. Wire requests are dispatched here one at a time.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::channel::wire::{Request, Response};
use crate::engine::{EngineApi, EngineBinding, FrameStore, STATIC_OPTION_BRIDGE};
use crate::output::{
    FileSink, Geometry, OutputMode, OutputPlatform, PrimaryOutputManager, SurrogateOutputManager,
    OUTPUT_NONE, PRIMARY_OUTPUT_ID,
};

use super::marker::RecoveryMarker;
use super::permissions::PermissionStore;

pub struct FacadeOptions {
    pub display: Geometry,
    pub mode: OutputMode,
    pub preview_interval: Duration,
    pub user_dir: Option<PathBuf>,
    pub resource_dir: Option<PathBuf>,
    pub bridge_library: Option<String>,
    /// Holds the grant store, the recovery marker, and exported frame
    /// segments.
    pub state_dir: PathBuf,
}

pub struct ControlFacade {
    platform: Arc<dyn OutputPlatform>,
    engine: EngineBinding,
    surrogate: SurrogateOutputManager,
    primary: Arc<PrimaryOutputManager>,
    mode: Mutex<OutputMode>,
    permissions: PermissionStore,
    marker: RecoveryMarker,
    setup_done: AtomicBool,
    user_dir: Option<PathBuf>,
    resource_dir: Option<PathBuf>,
    bridge_library: Option<String>,
}

impl ControlFacade {
    pub fn new(
        platform: Arc<dyn OutputPlatform>,
        api: Option<Arc<dyn EngineApi>>,
        options: FacadeOptions,
    ) -> Result<Self> {
        let store = Arc::new(FrameStore::new()?);
        let engine = EngineBinding::new(api, options.state_dir.join("frames"), store.clone());
        let surrogate = SurrogateOutputManager::new(
            platform.clone(),
            store.clone(),
            options.display,
            options.preview_interval,
        );
        let primary = Arc::new(PrimaryOutputManager::new(
            platform.clone(),
            store,
            options.preview_interval,
        ));
        Ok(Self {
            platform,
            engine,
            surrogate,
            primary,
            mode: Mutex::new(options.mode),
            permissions: PermissionStore::open(options.state_dir.join("grants.json")),
            marker: RecoveryMarker::new(&options.state_dir),
            setup_done: AtomicBool::new(false),
            user_dir: options.user_dir,
            resource_dir: options.resource_dir,
            bridge_library: options.bridge_library,
        })
    }

    /// Undo anything a crashed predecessor left behind. Runs before the
    /// control socket is opened.
    pub fn recover(&self) {
        if self.marker.exists() {
            warn!("stale forced-size marker found, restoring output size");
            if self.platform.set_forced_primary_size(None) {
                self.marker.clear();
            }
        }
    }

    /// One-time engine initialization. Repeated calls are no-ops. The
    /// caller's user directory wins over the configured one.
    pub fn setup(&self, user_dir: Option<&Path>) -> bool {
        if self
            .setup_done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("setup already done");
            return true;
        }
        if let Some(bridge) = &self.bridge_library {
            if !self.engine.set_static_option(STATIC_OPTION_BRIDGE, bridge) {
                warn!("failed to select bridge library {bridge}");
            }
        }
        if let Some(user_dir) = user_dir.or(self.user_dir.as_deref()) {
            if !self.engine.set_user_dir(user_dir) {
                warn!("failed to set engine user dir {user_dir:?}");
            }
        }
        if let Some(resource_dir) = &self.resource_dir {
            if !self.engine.load_resource(resource_dir) {
                warn!("failed to load base resource {resource_dir:?}");
            }
        }
        let created = self.engine.create();
        if !created {
            // Leave setup retryable when no instance came up.
            self.setup_done.store(false, Ordering::Release);
        }
        created
    }

    /// Version block for diagnostics. Never fails; missing pieces are
    /// reported as unavailable.
    pub fn version(&self) -> String {
        let mut block = String::new();
        let _ = writeln!(block, "controller: {}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(
            block,
            "engine: {}",
            self.engine.version().unwrap_or_else(|| "unavailable".to_string())
        );
        let _ = write!(
            block,
            "uid: {}",
            self.engine.uid().unwrap_or_else(|| "unknown".to_string())
        );
        block
    }

    /// Force the primary output size. The marker is written first so a
    /// crash mid-override still gets recovered on the next start.
    pub fn set_forced_output_size(&self, width: u32, height: u32) -> bool {
        if let Err(e) = self.marker.set() {
            warn!("refusing forced size, marker not writable: {e:#}");
            return false;
        }
        if self.platform.set_forced_primary_size(Some((width, height))) {
            info!("forced output size {width}x{height}");
            true
        } else {
            self.marker.clear();
            false
        }
    }

    pub fn clear_forced_output_size(&self) -> bool {
        let ok = self.platform.set_forced_primary_size(None);
        if ok {
            self.marker.clear();
            info!("forced output size cleared");
        }
        ok
    }

    pub fn set_monitor_surface(&self, path: Option<PathBuf>) -> bool {
        match path {
            Some(path) => match FileSink::open(path) {
                Ok(sink) => {
                    self.surrogate.set_preview(Some(Box::new(sink)));
                    true
                }
                Err(e) => {
                    warn!("failed to open preview sink: {e:#}");
                    false
                }
            },
            None => {
                self.surrogate.set_preview(None);
                true
            }
        }
    }

    /// Switch output strategy, stopping whatever the old mode had running.
    pub fn set_output_mode(&self, mode: OutputMode) {
        let mut current = self.mode.lock().unwrap();
        if *current == mode {
            return;
        }
        match *current {
            OutputMode::Primary => self.primary.stop(),
            OutputMode::Surrogate => self.surrogate.stop(),
        }
        info!("output mode {:?} -> {mode:?}", *current);
        *current = mode;
    }

    pub fn start_capture(&self) -> i32 {
        match *self.mode.lock().unwrap() {
            OutputMode::Primary => self.primary.start(),
            OutputMode::Surrogate => self.surrogate.start(),
        }
    }

    pub fn stop_capture(&self) {
        match *self.mode.lock().unwrap() {
            OutputMode::Primary => self.primary.stop(),
            OutputMode::Surrogate => self.surrogate.stop(),
        }
    }

    pub fn output_id(&self) -> i32 {
        match *self.mode.lock().unwrap() {
            OutputMode::Primary => {
                if self.primary.is_capturing() {
                    PRIMARY_OUTPUT_ID
                } else {
                    OUTPUT_NONE
                }
            }
            OutputMode::Surrogate => self.surrogate.output_id(),
        }
    }

    pub fn set_resolution(&self, width: u32, height: u32, dpi: u32) {
        self.surrogate.set_resolution(width, height, dpi);
    }

    /// Full teardown: engine instance, forced size, both output managers.
    pub fn destroy(&self) {
        self.engine.destroy();
        if self.marker.exists() {
            let _ = self.platform.set_forced_primary_size(None);
            self.marker.clear();
        }
        self.primary.stop();
        self.primary.shutdown_listener();
        self.surrogate.stop();
    }

    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Ok,
            Request::Version => Response::Text {
                value: Some(self.version()),
            },
            Request::Setup { user_dir } => Response::Bool {
                value: self.setup(user_dir.as_deref()),
            },
            Request::GrantPermissions { request } => Response::Grants {
                report: self.permissions.grant(&request),
            },
            Request::SetForcedOutputSize { width, height } => Response::Bool {
                value: self.set_forced_output_size(width, height),
            },
            Request::ClearForcedOutputSize => Response::Bool {
                value: self.clear_forced_output_size(),
            },
            Request::SetMonitorSurface { path } => Response::Bool {
                value: self.set_monitor_surface(path),
            },
            Request::SetOutputMode { mode } => {
                self.set_output_mode(mode);
                Response::Ok
            }
            Request::StartCapture => Response::Int {
                value: self.start_capture(),
            },
            Request::StopCapture => {
                self.stop_capture();
                Response::Ok
            }
            Request::GetOutputId => Response::Int {
                value: self.output_id(),
            },
            Request::SetResolution { width, height, dpi } => {
                self.set_resolution(width, height, dpi);
                Response::Ok
            }
            Request::LoadResource { path } => Response::Bool {
                value: self.engine.load_resource(&path),
            },
            Request::SetInstanceOption { key, value } => Response::Bool {
                value: self.engine.set_instance_option(key, &value),
            },
            Request::AppendTask { task_type, params } => Response::Int {
                value: self.engine.append_task(&task_type, &params),
            },
            Request::SetTaskParams { task_id, params } => Response::Bool {
                value: self.engine.set_task_params(task_id, &params),
            },
            Request::GetTasksList => Response::IntList {
                values: self.engine.task_list(),
            },
            Request::Start => Response::Bool {
                value: self.engine.start(),
            },
            Request::Stop => Response::Bool {
                value: self.engine.stop(),
            },
            Request::Running => Response::Bool {
                value: self.engine.running(),
            },
            Request::BackToHome => Response::Bool {
                value: self.engine.back_to_home(),
            },
            Request::GetUuid => Response::Text {
                value: self.engine.uid(),
            },
            Request::GetImage => Response::Frame {
                frame: self.engine.get_image(),
            },
            Request::GetImageBgr => Response::Frame {
                frame: self.engine.get_image_bgr(),
            },
            Request::Exit => Response::Ok,
        }
    }
}
