use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// On-disk marker set while a forced output size is active. A marker found
/// at startup means a previous worker crashed with the override still
/// applied, and the size must be restored before serving.
pub struct RecoveryMarker {
    path: PathBuf,
}

impl RecoveryMarker {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("forced-size.marker"),
        }
    }

    /// Set the marker. Must happen before the override is applied, so a
    /// crash between the two still gets recovered.
    pub fn set(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create marker directory {parent:?}"))?;
        }
        std::fs::write(&self.path, b"")
            .with_context(|| format!("failed to write marker {:?}", self.path))
    }

    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to clear marker {:?}: {e}", self.path);
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_cycle() {
        let dir = std::env::temp_dir().join(format!("spx-marker-{}", uuid::Uuid::new_v4()));
        let marker = RecoveryMarker::new(&dir);

        assert!(!marker.exists());
        marker.set().unwrap();
        assert!(marker.exists());
        marker.clear();
        assert!(!marker.exists());
        // Clearing an absent marker is fine.
        marker.clear();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
