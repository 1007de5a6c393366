//! Dynamic binding to the native engine shared library.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;

use anyhow::{Context, Result};
use libloading::Library;
use tracing::warn;

use super::api::{EngineApi, EngineInstance};

type Handle = *mut c_void;

/// Sentinel returned by the sized query entry points on failure.
const GET_FAILED: u64 = u64::MAX;

const TASK_LIST_CAP: usize = 256;
const UID_CAP: usize = 64;

/// Resolved entry points. Plain fn pointers copied out of the library so
/// calls don't go through `Symbol` lookups.
struct RawApi {
    version: unsafe extern "C" fn() -> *const c_char,
    set_static_option: unsafe extern "C" fn(c_int, *const c_char) -> u8,
    set_user_dir: unsafe extern "C" fn(*const c_char) -> u8,
    load_resource: unsafe extern "C" fn(*const c_char) -> u8,
    create: unsafe extern "C" fn() -> Handle,
    destroy: unsafe extern "C" fn(Handle),
    set_instance_option: unsafe extern "C" fn(Handle, c_int, *const c_char) -> u8,
    append_task: unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
    set_task_params: unsafe extern "C" fn(Handle, c_int, *const c_char) -> u8,
    task_list: unsafe extern "C" fn(Handle, *mut c_int, u64) -> u64,
    start: unsafe extern "C" fn(Handle) -> u8,
    stop: unsafe extern "C" fn(Handle) -> u8,
    running: unsafe extern "C" fn(Handle) -> u8,
    back_to_home: unsafe extern "C" fn(Handle) -> u8,
    attach_frame_buffer: unsafe extern "C" fn(Handle, *const u8, u64) -> u8,
    get_image: unsafe extern "C" fn(Handle, *mut u8, u64) -> u64,
    get_image_bgr: unsafe extern "C" fn(Handle, *mut u8, u64) -> u64,
    uid: unsafe extern "C" fn(Handle, *mut c_char, u64) -> u64,
}

/// A loaded engine library. The `Library` handle is kept alive for as
/// long as any resolved fn pointer may be called.
pub struct EngineLibrary {
    raw: RawApi,
    _lib: Library,
}

impl EngineLibrary {
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load engine library {}", path.display()))?;

        macro_rules! sym {
            ($ty:ty, $name:literal) => {{
                let symbol: libloading::Symbol<$ty> = unsafe { lib.get($name) }
                    .with_context(|| {
                        format!(
                            "engine library missing symbol {}",
                            String::from_utf8_lossy(&$name[..$name.len() - 1])
                        )
                    })?;
                *symbol
            }};
        }

        let raw = RawApi {
            version: sym!(unsafe extern "C" fn() -> *const c_char, b"engine_version\0"),
            set_static_option: sym!(
                unsafe extern "C" fn(c_int, *const c_char) -> u8,
                b"engine_set_static_option\0"
            ),
            set_user_dir: sym!(
                unsafe extern "C" fn(*const c_char) -> u8,
                b"engine_set_user_dir\0"
            ),
            load_resource: sym!(
                unsafe extern "C" fn(*const c_char) -> u8,
                b"engine_load_resource\0"
            ),
            create: sym!(unsafe extern "C" fn() -> Handle, b"engine_create\0"),
            destroy: sym!(unsafe extern "C" fn(Handle), b"engine_destroy\0"),
            set_instance_option: sym!(
                unsafe extern "C" fn(Handle, c_int, *const c_char) -> u8,
                b"engine_set_instance_option\0"
            ),
            append_task: sym!(
                unsafe extern "C" fn(Handle, *const c_char, *const c_char) -> c_int,
                b"engine_append_task\0"
            ),
            set_task_params: sym!(
                unsafe extern "C" fn(Handle, c_int, *const c_char) -> u8,
                b"engine_set_task_params\0"
            ),
            task_list: sym!(
                unsafe extern "C" fn(Handle, *mut c_int, u64) -> u64,
                b"engine_get_tasks_list\0"
            ),
            start: sym!(unsafe extern "C" fn(Handle) -> u8, b"engine_start\0"),
            stop: sym!(unsafe extern "C" fn(Handle) -> u8, b"engine_stop\0"),
            running: sym!(unsafe extern "C" fn(Handle) -> u8, b"engine_running\0"),
            back_to_home: sym!(
                unsafe extern "C" fn(Handle) -> u8,
                b"engine_back_to_home\0"
            ),
            attach_frame_buffer: sym!(
                unsafe extern "C" fn(Handle, *const u8, u64) -> u8,
                b"engine_attach_frame_buffer\0"
            ),
            get_image: sym!(
                unsafe extern "C" fn(Handle, *mut u8, u64) -> u64,
                b"engine_get_image\0"
            ),
            get_image_bgr: sym!(
                unsafe extern "C" fn(Handle, *mut u8, u64) -> u64,
                b"engine_get_image_bgr\0"
            ),
            uid: sym!(
                unsafe extern "C" fn(Handle, *mut c_char, u64) -> u64,
                b"engine_get_uuid\0"
            ),
        };

        Ok(Self { raw, _lib: lib })
    }
}

fn cstring(value: &str) -> Option<CString> {
    match CString::new(value) {
        Ok(s) => Some(s),
        Err(_) => {
            warn!("argument contains an interior NUL byte, dropping call");
            None
        }
    }
}

fn cstring_path(path: &Path) -> Option<CString> {
    match path.to_str() {
        Some(s) => cstring(s),
        None => {
            warn!("path {} is not valid UTF-8, dropping call", path.display());
            None
        }
    }
}

fn handle(instance: EngineInstance) -> Handle {
    instance.0 as Handle
}

impl EngineApi for EngineLibrary {
    fn version(&self) -> Option<String> {
        let ptr = unsafe { (self.raw.version)() };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    fn set_static_option(&self, key: i32, value: &str) -> bool {
        let Some(value) = cstring(value) else {
            return false;
        };
        unsafe { (self.raw.set_static_option)(key, value.as_ptr()) != 0 }
    }

    fn set_user_dir(&self, path: &Path) -> bool {
        let Some(path) = cstring_path(path) else {
            return false;
        };
        unsafe { (self.raw.set_user_dir)(path.as_ptr()) != 0 }
    }

    fn load_resource(&self, path: &Path) -> bool {
        let Some(path) = cstring_path(path) else {
            return false;
        };
        unsafe { (self.raw.load_resource)(path.as_ptr()) != 0 }
    }

    fn create(&self) -> Option<EngineInstance> {
        let raw = unsafe { (self.raw.create)() };
        if raw.is_null() {
            None
        } else {
            Some(EngineInstance(raw as usize))
        }
    }

    fn destroy(&self, instance: EngineInstance) {
        unsafe { (self.raw.destroy)(handle(instance)) }
    }

    fn set_instance_option(&self, instance: EngineInstance, key: i32, value: &str) -> bool {
        let Some(value) = cstring(value) else {
            return false;
        };
        unsafe { (self.raw.set_instance_option)(handle(instance), key, value.as_ptr()) != 0 }
    }

    fn append_task(&self, instance: EngineInstance, task_type: &str, params: &str) -> i32 {
        let (Some(task_type), Some(params)) = (cstring(task_type), cstring(params)) else {
            return 0;
        };
        unsafe { (self.raw.append_task)(handle(instance), task_type.as_ptr(), params.as_ptr()) }
    }

    fn set_task_params(&self, instance: EngineInstance, task_id: i32, params: &str) -> bool {
        let Some(params) = cstring(params) else {
            return false;
        };
        unsafe { (self.raw.set_task_params)(handle(instance), task_id, params.as_ptr()) != 0 }
    }

    fn task_list(&self, instance: EngineInstance) -> Vec<i32> {
        let mut buf = [0 as c_int; TASK_LIST_CAP];
        let n = unsafe {
            (self.raw.task_list)(handle(instance), buf.as_mut_ptr(), TASK_LIST_CAP as u64)
        };
        if n == GET_FAILED {
            return Vec::new();
        }
        let n = (n as usize).min(TASK_LIST_CAP);
        buf[..n].to_vec()
    }

    fn start(&self, instance: EngineInstance) -> bool {
        unsafe { (self.raw.start)(handle(instance)) != 0 }
    }

    fn stop(&self, instance: EngineInstance) -> bool {
        unsafe { (self.raw.stop)(handle(instance)) != 0 }
    }

    fn running(&self, instance: EngineInstance) -> bool {
        unsafe { (self.raw.running)(handle(instance)) != 0 }
    }

    fn back_to_home(&self, instance: EngineInstance) -> bool {
        unsafe { (self.raw.back_to_home)(handle(instance)) != 0 }
    }

    fn attach_frame_buffer(&self, instance: EngineInstance, base: *const u8, len: usize) -> bool {
        unsafe { (self.raw.attach_frame_buffer)(handle(instance), base, len as u64) != 0 }
    }

    fn get_image(&self, instance: EngineInstance, buf: &mut [u8]) -> Option<usize> {
        let n =
            unsafe { (self.raw.get_image)(handle(instance), buf.as_mut_ptr(), buf.len() as u64) };
        if n == GET_FAILED {
            return None;
        }
        Some((n as usize).min(buf.len()))
    }

    fn get_image_bgr(&self, instance: EngineInstance, buf: &mut [u8]) -> Option<usize> {
        let n = unsafe {
            (self.raw.get_image_bgr)(handle(instance), buf.as_mut_ptr(), buf.len() as u64)
        };
        if n == GET_FAILED {
            return None;
        }
        Some((n as usize).min(buf.len()))
    }

    fn uid(&self, instance: EngineInstance) -> Option<String> {
        let mut buf = [0u8; UID_CAP];
        let n = unsafe {
            (self.raw.uid)(handle(instance), buf.as_mut_ptr() as *mut c_char, UID_CAP as u64)
        };
        if n == GET_FAILED {
            return None;
        }
        let n = (n as usize).min(UID_CAP);
        Some(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}
