//! In-memory engine double for tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::api::{EngineApi, EngineInstance};

/// Records every call and plays back canned answers.
#[derive(Default)]
pub struct TestEngine {
    next_instance: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    next_task: AtomicI32,
    tasks: Mutex<Vec<i32>>,
    running: AtomicBool,
    image: Mutex<Vec<u8>>,
    static_options: Mutex<Vec<(i32, String)>>,
    instance_options: Mutex<Vec<(i32, String)>>,
    loaded_resources: Mutex<Vec<PathBuf>>,
    user_dir: Mutex<Option<PathBuf>>,
    attached: Mutex<Option<(usize, usize)>>,
    fail_create: AtomicBool,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_image(&self, data: Vec<u8>) {
        *self.image.lock().unwrap() = data;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live_instances(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn static_options(&self) -> Vec<(i32, String)> {
        self.static_options.lock().unwrap().clone()
    }

    pub fn instance_options(&self) -> Vec<(i32, String)> {
        self.instance_options.lock().unwrap().clone()
    }

    pub fn loaded_resources(&self) -> Vec<PathBuf> {
        self.loaded_resources.lock().unwrap().clone()
    }

    pub fn attached_buffer(&self) -> Option<(usize, usize)> {
        *self.attached.lock().unwrap()
    }

    pub fn user_dir(&self) -> Option<PathBuf> {
        self.user_dir.lock().unwrap().clone()
    }
}

impl EngineApi for TestEngine {
    fn version(&self) -> Option<String> {
        Some("0.0.0-test".to_string())
    }

    fn set_static_option(&self, key: i32, value: &str) -> bool {
        self.static_options
            .lock()
            .unwrap()
            .push((key, value.to_string()));
        true
    }

    fn set_user_dir(&self, path: &Path) -> bool {
        *self.user_dir.lock().unwrap() = Some(path.to_path_buf());
        true
    }

    fn load_resource(&self, path: &Path) -> bool {
        self.loaded_resources.lock().unwrap().push(path.to_path_buf());
        true
    }

    fn create(&self) -> Option<EngineInstance> {
        if self.fail_create.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id);
        self.tasks.lock().unwrap().clear();
        self.running.store(false, Ordering::SeqCst);
        Some(EngineInstance(id))
    }

    fn destroy(&self, instance: EngineInstance) {
        if self.live.lock().unwrap().remove(&instance.0) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_instance_option(&self, _instance: EngineInstance, key: i32, value: &str) -> bool {
        self.instance_options
            .lock()
            .unwrap()
            .push((key, value.to_string()));
        true
    }

    fn append_task(&self, _instance: EngineInstance, _task_type: &str, _params: &str) -> i32 {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst) + 1;
        self.tasks.lock().unwrap().push(id);
        id
    }

    fn set_task_params(&self, _instance: EngineInstance, task_id: i32, _params: &str) -> bool {
        self.tasks.lock().unwrap().contains(&task_id)
    }

    fn task_list(&self, _instance: EngineInstance) -> Vec<i32> {
        self.tasks.lock().unwrap().clone()
    }

    fn start(&self, _instance: EngineInstance) -> bool {
        self.running.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self, _instance: EngineInstance) -> bool {
        self.running.store(false, Ordering::SeqCst);
        true
    }

    fn running(&self, _instance: EngineInstance) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn back_to_home(&self, _instance: EngineInstance) -> bool {
        true
    }

    fn attach_frame_buffer(&self, _instance: EngineInstance, base: *const u8, len: usize) -> bool {
        *self.attached.lock().unwrap() = Some((base as usize, len));
        true
    }

    fn get_image(&self, _instance: EngineInstance, buf: &mut [u8]) -> Option<usize> {
        let image = self.image.lock().unwrap();
        if image.len() > buf.len() {
            return None;
        }
        buf[..image.len()].copy_from_slice(&image);
        Some(image.len())
    }

    fn get_image_bgr(&self, instance: EngineInstance, buf: &mut [u8]) -> Option<usize> {
        self.get_image(instance, buf)
    }

    fn uid(&self, instance: EngineInstance) -> Option<String> {
        Some(format!("test-{}", instance.0))
    }
}
