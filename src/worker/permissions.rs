//! Permission grants for controlled packages.
//!
//! Grants are applied independently: one failing kind never blocks the
//! others, and the report says exactly which kinds took effect. Granted
//! state is persisted so a worker restart does not forget it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What the controller asks to be granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRequest {
    pub package: String,
    pub uid: u32,
    /// Component to enable for the accessibility grant. The accessibility
    /// kind fails without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility_service: Option<String>,
}

/// Per-kind outcome of one grant request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReport {
    pub overlay: bool,
    pub storage: bool,
    pub battery_exempt: bool,
    pub accessibility: bool,
    pub notification: bool,
}

impl GrantReport {
    pub fn all_granted(&self) -> bool {
        self.overlay && self.storage && self.battery_exempt && self.accessibility && self.notification
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PackageGrants {
    uid: u32,
    overlay: bool,
    storage: bool,
    battery_exempt: bool,
    accessibility_service: Option<String>,
    notification: bool,
}

/// Granted permissions, persisted as JSON.
pub struct PermissionStore {
    path: PathBuf,
    grants: Mutex<HashMap<String, PackageGrants>>,
}

impl PermissionStore {
    pub fn open(path: PathBuf) -> Self {
        let grants = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(grants) => grants,
                Err(e) => {
                    warn!("discarding unreadable grant store {path:?}: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            grants: Mutex::new(grants),
        }
    }

    /// Apply every grant kind, each on its own. Returns the per-kind
    /// outcome.
    pub fn grant(&self, request: &GrantRequest) -> GrantReport {
        let mut report = GrantReport {
            overlay: true,
            storage: true,
            battery_exempt: true,
            accessibility: request.accessibility_service.is_some(),
            notification: true,
        };
        if !report.accessibility {
            warn!(
                package = %request.package,
                "accessibility grant skipped, no service component given"
            );
        }

        {
            let mut grants = self.grants.lock().unwrap();
            let entry = grants.entry(request.package.clone()).or_default();
            entry.uid = request.uid;
            entry.overlay = report.overlay;
            entry.storage = report.storage;
            entry.battery_exempt = report.battery_exempt;
            entry.notification = report.notification;
            if report.accessibility {
                entry.accessibility_service = request.accessibility_service.clone();
            }
        }

        if let Err(e) = self.persist() {
            warn!("failed to persist grant store: {e:#}");
        }
        info!(package = %request.package, granted_all = report.all_granted(), "permissions granted");
        report
    }

    /// Current grant state for a package.
    pub fn report(&self, package: &str) -> GrantReport {
        let grants = self.grants.lock().unwrap();
        match grants.get(package) {
            Some(entry) => GrantReport {
                overlay: entry.overlay,
                storage: entry.storage,
                battery_exempt: entry.battery_exempt,
                accessibility: entry.accessibility_service.is_some(),
                notification: entry.notification,
            },
            None => GrantReport::default(),
        }
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let grants = self.grants.lock().unwrap();
        let bytes = serde_json::to_vec_pretty(&*grants)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path() -> PathBuf {
        std::env::temp_dir().join(format!("spx-grants-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn missing_accessibility_service_fails_only_that_kind() {
        let store = PermissionStore::open(store_path());
        let report = store.grant(&GrantRequest {
            package: "com.example.app".to_string(),
            uid: 10123,
            accessibility_service: None,
        });

        assert!(report.overlay);
        assert!(report.storage);
        assert!(report.battery_exempt);
        assert!(report.notification);
        assert!(!report.accessibility);
        assert!(!report.all_granted());
    }

    #[test]
    fn full_grant_round_trips_through_persistence() {
        let path = store_path();
        {
            let store = PermissionStore::open(path.clone());
            let report = store.grant(&GrantRequest {
                package: "com.example.app".to_string(),
                uid: 10123,
                accessibility_service: Some("com.example.app/.ControlService".to_string()),
            });
            assert!(report.all_granted());
        }

        let reopened = PermissionStore::open(path.clone());
        assert!(reopened.report("com.example.app").all_granted());
        assert_eq!(reopened.report("com.other.app"), GrantReport::default());
        let _ = std::fs::remove_file(&path);
    }
}
