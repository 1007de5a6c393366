//! Native automation engine: ABI trait, dynamic library loader, instance
//! binding, and the shared-memory frame plumbing.

mod api;
mod binding;
mod frame;
mod library;

#[cfg(test)]
pub mod testing;

pub use api::{EngineApi, EngineInstance, STATIC_OPTION_BRIDGE};
pub use binding::EngineBinding;
pub use frame::{export_segment, ExportedFrame, FrameStore, MAX_FRAME_BYTES};
pub use library::EngineLibrary;
