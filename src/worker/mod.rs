//! The privileged worker process.
//!
//! Spawned by the controller with `--worker`, it serves the control
//! facade over a Unix socket until told to exit or, unless running as a
//! daemon, until the controller goes away.

mod facade;
mod marker;
mod permissions;

pub use facade::{ControlFacade, FacadeOptions};
pub use marker::RecoveryMarker;
pub use permissions::{GrantReport, GrantRequest, PermissionStore};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::channel::wire::{read_message, write_message, Request, Response};
use crate::config::Config;
use crate::engine::{EngineApi, EngineLibrary};
use crate::output::{HeadlessPlatform, OutputPlatform};

#[derive(Debug)]
pub struct WorkerArgs {
    pub socket: PathBuf,
    pub session: String,
    pub daemon: bool,
    pub debuggable: bool,
}

/// Worker main loop. Returns when the worker should exit.
pub async fn run(args: WorkerArgs, config: Config) -> Result<()> {
    let platform: Arc<dyn OutputPlatform> =
        Arc::new(HeadlessPlatform::new(config.display.geometry()));

    let api: Option<Arc<dyn EngineApi>> = match &config.engine.library {
        Some(path) => match EngineLibrary::load(path) {
            Ok(library) => Some(Arc::new(library)),
            Err(e) => {
                warn!("engine library unavailable: {e:#}");
                None
            }
        },
        None => None,
    };

    let facade = Arc::new(ControlFacade::new(
        platform,
        api,
        FacadeOptions {
            display: config.display.geometry(),
            mode: config.display.mode,
            preview_interval: config.capture.preview_interval(),
            user_dir: config.engine.user_dir.clone(),
            resource_dir: config.engine.resource_dir.clone(),
            bridge_library: config.engine.bridge.clone(),
            state_dir: Config::state_dir()?,
        },
    )?);
    facade.recover();

    if let Some(parent) = args.socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {parent:?}"))?;
    }
    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("failed to bind control socket {:?}", args.socket))?;
    info!(session = %args.session, socket = ?args.socket, "worker serving");

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("control socket accept failed")?;
        info!("controller connected");

        match serve_connection(stream, facade.clone()).await {
            Ok(true) => {
                info!("exit requested, shutting down");
                break;
            }
            Ok(false) if !args.daemon => {
                info!("controller disconnected, shutting down");
                break;
            }
            Ok(false) => info!("controller disconnected, staying alive as daemon"),
            Err(e) => warn!("connection failed: {e:#}"),
        }
    }

    facade.destroy();
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}

/// Serve one controller connection. Returns `true` if an exit was
/// requested.
async fn serve_connection(stream: UnixStream, facade: Arc<ControlFacade>) -> Result<bool> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let Some(request) = read_message::<_, Request>(&mut reader).await? else {
            return Ok(false);
        };

        if matches!(request, Request::Exit) {
            write_message(&mut write_half, &Response::Ok).await?;
            return Ok(true);
        }

        // Dispatch can block on thread joins; keep it off the reactor.
        let facade = facade.clone();
        let response = match tokio::task::spawn_blocking(move || facade.dispatch(request)).await {
            Ok(response) => response,
            // A panicking operation is fatal to the whole worker, not
            // just this request.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => return Err(e).context("dispatch task cancelled"),
        };
        write_message(&mut write_half, &response).await?;
    }
}
