//! Cross-process control channel
//!
//! The controller binds the privileged worker process through here: spawn,
//! connect, observe, tear down. Connection state is published through a
//! `watch` channel so callers can await a terminal state, and worker death
//! is distinguished from intentional teardown at the source.

mod handle;
mod manager;
mod session;
mod spawn;
pub mod wire;

pub use handle::RemoteHandle;
pub use manager::ConnectionManager;
pub use session::ChannelSession;
pub use spawn::{ProcessSpawner, SpawnedWorker, WorkerSpawner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timed out waiting for the worker")]
    Timeout,

    #[error("worker process died")]
    Died,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to bind worker: {0}")]
    Bind(String),

    #[error("worker reported an error: {0}")]
    Remote(String),
}

/// Observable lifecycle of the worker binding.
#[derive(Clone, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Worker spawned, socket not yet accepted.
    Connecting,
    Connected(RemoteHandle),
    /// The worker exited without being asked to.
    Died,
    Error(String),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Died => "died",
            ConnectionState::Error(_) => "error",
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Error(msg) => write!(f, "error({msg})"),
            other => f.write_str(other.name()),
        }
    }
}
