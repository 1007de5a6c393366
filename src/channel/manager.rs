//! Worker binding lifecycle.
//!
//! `bind` spawns the worker and hands off to two background tasks: a
//! connector that dials the control socket until the worker answers, and a
//! monitor that turns process exit into `Disconnected` or `Died`. Every
//! binding gets an epoch; a task whose epoch is stale observed an older
//! worker and must not touch the current state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::spawn::{SpawnedWorker, WorkerSpawner};
use super::wire::Request;
use super::{ChannelError, ChannelSession, ConnectionState, RemoteHandle};

const CONNECT_RETRY: Duration = Duration::from_millis(20);
const EXIT_GRACE: Duration = Duration::from_secs(1);

struct ActiveBinding {
    session: ChannelSession,
    kill: Option<Box<dyn FnOnce() + Send>>,
}

pub struct ConnectionManager {
    spawner: Arc<dyn WorkerSpawner>,
    state_tx: watch::Sender<ConnectionState>,
    connect_timeout: Duration,
    daemon: bool,
    debuggable: bool,
    /// Set by `unbind` so the monitor can tell teardown from a crash.
    intentional: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    active: Mutex<Option<ActiveBinding>>,
}

impl ConnectionManager {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        connect_timeout: Duration,
        daemon: bool,
        debuggable: bool,
    ) -> Self {
        Self {
            spawner,
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            connect_timeout,
            daemon,
            debuggable,
            intentional: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Spawn and connect a worker. A bind while one is already in flight
    /// is a no-op; a bind while connected replaces the worker.
    pub async fn bind(&self) -> Result<(), ChannelError> {
        match self.current_state() {
            ConnectionState::Connecting => {
                info!("bind ignored, connection already in flight");
                return Ok(());
            }
            ConnectionState::Connected(_) => {
                info!("bind while connected, replacing worker");
                self.unbind().await;
            }
            _ => {}
        }

        let session = ChannelSession::next(self.daemon, self.debuggable);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.intentional.store(false, Ordering::SeqCst);
        info!(session = %session.token(), "binding worker");

        let SpawnedWorker {
            socket_path,
            exited,
            kill,
        } = match self.spawner.spawn(&session) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state_tx
                    .send_replace(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };

        *self.active.lock().await = Some(ActiveBinding {
            session,
            kill: Some(kill),
        });
        self.state_tx.send_replace(ConnectionState::Connecting);

        let state_tx = self.state_tx.clone();
        let epoch_guard = self.epoch.clone();
        let deadline = Instant::now() + self.connect_timeout;
        tokio::spawn(async move {
            loop {
                if epoch_guard.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match UnixStream::connect(&socket_path).await {
                    Ok(stream) => {
                        if epoch_guard.load(Ordering::SeqCst) == epoch {
                            state_tx
                                .send_replace(ConnectionState::Connected(RemoteHandle::new(stream)));
                            info!("worker connected");
                        }
                        return;
                    }
                    Err(e) if Instant::now() >= deadline => {
                        if epoch_guard.load(Ordering::SeqCst) == epoch {
                            warn!("worker never answered: {e}");
                            state_tx.send_replace(ConnectionState::Error(format!(
                                "worker connection timed out: {e}"
                            )));
                        }
                        return;
                    }
                    Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
                }
            }
        });

        let state_tx = self.state_tx.clone();
        let epoch_guard = self.epoch.clone();
        let intentional = self.intentional.clone();
        tokio::spawn(async move {
            let _ = exited.await;
            if epoch_guard.load(Ordering::SeqCst) != epoch {
                debug!("stale worker exit, ignoring");
                return;
            }
            if intentional.swap(false, Ordering::SeqCst) {
                state_tx.send_replace(ConnectionState::Disconnected);
            } else {
                warn!("worker died unexpectedly");
                state_tx.send_replace(ConnectionState::Died);
            }
        });

        Ok(())
    }

    /// Tear down the current worker. The worker is asked to exit on its
    /// own first; the kill is the backstop.
    pub async fn unbind(&self) {
        let Some(mut active) = self.active.lock().await.take() else {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return;
        };
        info!(session = %active.session.token(), "unbinding worker");
        // Invalidate the binding's connector and monitor: neither may
        // touch the state after an intentional teardown.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.intentional.store(true, Ordering::SeqCst);

        if let ConnectionState::Connected(handle) = self.current_state() {
            if tokio::time::timeout(EXIT_GRACE, handle.call(&Request::Exit))
                .await
                .is_err()
            {
                debug!("worker did not acknowledge exit in time");
            }
        }

        if let Some(kill) = active.kill.take() {
            kill();
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Return the current handle if the worker still answers, otherwise
    /// bind a fresh worker and wait for the binding to reach a terminal
    /// state. A dead or never-bound channel recovers here instead of
    /// erroring forever.
    pub async fn get_instance(&self, timeout: Duration) -> Result<RemoteHandle, ChannelError> {
        if let Some(handle) = self.get_instance_or_null().await {
            return Ok(handle);
        }
        self.bind().await?;

        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected(_)
                        | ConnectionState::Died
                        | ConnectionState::Error(_)
                )
            }),
        )
        .await;

        match waited {
            Err(_) => Err(ChannelError::Timeout),
            Ok(Err(_)) => Err(ChannelError::Died),
            Ok(Ok(state)) => match &*state {
                ConnectionState::Connected(handle) => Ok(handle.clone()),
                ConnectionState::Died => Err(ChannelError::Died),
                ConnectionState::Error(message) => Err(ChannelError::Bind(message.clone())),
                _ => Err(ChannelError::Timeout),
            },
        }
    }

    /// The current handle, only if the worker actually answers a ping.
    pub async fn get_instance_or_null(&self) -> Option<RemoteHandle> {
        let ConnectionState::Connected(handle) = self.current_state() else {
            return None;
        };
        if handle.ping().await {
            Some(handle)
        } else {
            None
        }
    }
}
