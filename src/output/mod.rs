//! Virtual output management and frame capture
//!
//! Two interchangeable strategies create the off-screen output the target
//! app renders into: attaching a mirror to the primary output, or creating
//! a standalone surrogate output at a configured resolution. Both feed the
//! same capture pipeline, which copies produced frames into the shared
//! frame store consumed by the automation engine.

mod manager;
mod pipeline;
mod platform;

pub use manager::{PrimaryOutputManager, SurrogateOutputManager, PRIMARY_OUTPUT_ID};
pub use pipeline::{CapturePipeline, FileSink, PreviewSink, PreviewSlot};
pub use platform::{Frame, FrameProducer, HeadlessPlatform, OutputDevice, OutputPlatform};

use serde::{Deserialize, Serialize};

/// Returned by output-id queries when no output is active.
pub const OUTPUT_NONE: i32 = -1;

/// Which strategy serves virtual-output operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Mirror the primary physical output.
    Primary,
    /// Create a standalone off-screen output at a configured resolution.
    #[default]
    Surrogate,
}

/// Output geometry negotiated for a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32, dpi: u32) -> Self {
        Self { width, height, dpi }
    }

    /// Frame byte size at 4 bytes per pixel.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}dpi", self.width, self.height, self.dpi)
    }
}
