use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

/// Binding versions are process-global and monotonic so a stale worker can
/// never be confused with the current one. Seeded above zero so version 0
/// is unambiguously "never bound".
static NEXT_VERSION: AtomicU32 = AtomicU32::new(100);

/// Identity of one worker binding attempt.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub tag: String,
    pub version: u32,
    /// Keep the worker alive after the controller exits.
    pub daemon: bool,
    /// Enable verbose worker-side logging.
    pub debuggable: bool,
}

impl ChannelSession {
    pub fn next(daemon: bool, debuggable: bool) -> Self {
        Self {
            tag: Uuid::new_v4().to_string(),
            version: NEXT_VERSION.fetch_add(1, Ordering::SeqCst),
            daemon,
            debuggable,
        }
    }

    /// `tag:version`, the form passed on the worker command line.
    pub fn token(&self) -> String {
        format!("{}:{}", self.tag, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_monotonic_and_seeded() {
        let a = ChannelSession::next(false, false);
        let b = ChannelSession::next(false, false);
        assert!(a.version >= 100);
        assert!(b.version > a.version);
        assert_ne!(a.tag, b.tag);
    }

    #[test]
    fn token_combines_tag_and_version() {
        let s = ChannelSession::next(true, false);
        assert_eq!(s.token(), format!("{}:{}", s.tag, s.version));
    }
}
