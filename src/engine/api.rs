//! Automation engine capability surface.
//!
//! Everything the worker needs from the native engine library, expressed
//! as a trait so the binding layer can run against a test double.

use std::path::Path;

/// Static option key selecting the control bridge library.
pub const STATIC_OPTION_BRIDGE: i32 = 3;

/// Opaque engine instance handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInstance(pub usize);

/// The native engine ABI, one method per exported entry point.
///
/// Boolean entry points report success; the query entry points return
/// `None` when the engine rejects the call.
pub trait EngineApi: Send + Sync {
    fn version(&self) -> Option<String>;

    /// Set a process-wide option before any instance exists.
    fn set_static_option(&self, key: i32, value: &str) -> bool;

    fn set_user_dir(&self, path: &Path) -> bool;

    fn load_resource(&self, path: &Path) -> bool;

    fn create(&self) -> Option<EngineInstance>;

    fn destroy(&self, instance: EngineInstance);

    fn set_instance_option(&self, instance: EngineInstance, key: i32, value: &str) -> bool;

    /// Append a task, returning its id. Zero means the engine refused it.
    fn append_task(&self, instance: EngineInstance, task_type: &str, params: &str) -> i32;

    fn set_task_params(&self, instance: EngineInstance, task_id: i32, params: &str) -> bool;

    fn task_list(&self, instance: EngineInstance) -> Vec<i32>;

    fn start(&self, instance: EngineInstance) -> bool;

    fn stop(&self, instance: EngineInstance) -> bool;

    fn running(&self, instance: EngineInstance) -> bool;

    fn back_to_home(&self, instance: EngineInstance) -> bool;

    /// Hand the engine a raw view of the shared frame buffer. The caller
    /// guarantees the region stays mapped for the life of the instance.
    fn attach_frame_buffer(&self, instance: EngineInstance, base: *const u8, len: usize) -> bool;

    /// Copy the engine's current RGBA image into `buf`, returning the
    /// number of bytes written.
    fn get_image(&self, instance: EngineInstance, buf: &mut [u8]) -> Option<usize>;

    /// Like [`EngineApi::get_image`] but BGR byte order.
    fn get_image_bgr(&self, instance: EngineInstance, buf: &mut [u8]) -> Option<usize>;

    fn uid(&self, instance: EngineInstance) -> Option<String>;
}
