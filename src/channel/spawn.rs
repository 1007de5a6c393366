use std::path::PathBuf;

use tokio::sync::oneshot;
use tracing::{info, warn};

use super::{ChannelError, ChannelSession};

/// A spawned worker process before the control socket is connected.
pub struct SpawnedWorker {
    /// Where the worker will listen.
    pub socket_path: PathBuf,
    /// Resolves exactly once, when the worker process exits.
    pub exited: oneshot::Receiver<()>,
    /// Force-terminate the worker. Consumed by teardown.
    pub kill: Box<dyn FnOnce() + Send>,
}

/// How worker processes come into existence. The production impl re-execs
/// the current binary; tests substitute an in-process worker.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, session: &ChannelSession) -> Result<SpawnedWorker, ChannelError>;
}

/// Spawns the worker by re-executing the current binary with `--worker`.
pub struct ProcessSpawner {
    runtime_dir: PathBuf,
}

impl ProcessSpawner {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self { runtime_dir }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, session: &ChannelSession) -> Result<SpawnedWorker, ChannelError> {
        std::fs::create_dir_all(&self.runtime_dir)?;
        let socket_path = self
            .runtime_dir
            .join(format!("worker-{}.sock", session.version));
        // A stale socket file from a crashed worker would fail the bind.
        let _ = std::fs::remove_file(&socket_path);

        let exe = std::env::current_exe()?;
        let mut command = tokio::process::Command::new(exe);
        command
            .arg("--worker")
            .arg("--socket")
            .arg(&socket_path)
            .arg("--session")
            .arg(session.token());
        if session.daemon {
            command.arg("--daemon");
        }
        if session.debuggable {
            command.arg("--debuggable");
        }

        let mut child = command.spawn()?;
        info!(
            session = %session.token(),
            pid = child.id(),
            "worker process spawned"
        );

        let (exit_tx, exited) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let token = session.token();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!(session = %token, %status, "worker exited"),
                    Err(e) => warn!(session = %token, "failed to reap worker: {e}"),
                },
                _ = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(session = %token, "failed to kill worker: {e}");
                    }
                    let _ = child.wait().await;
                    info!(session = %token, "worker killed");
                }
            }
            let _ = exit_tx.send(());
        });

        Ok(SpawnedWorker {
            socket_path,
            exited,
            kill: Box::new(move || {
                let _ = kill_tx.send(());
            }),
        })
    }
}
