//! screenpilot
//!
//! Controller for a privileged automation worker. The default invocation
//! runs the controller; `--worker` runs the worker process the controller
//! spawns, serving the control facade over a Unix socket.

mod channel;
mod config;
mod engine;
mod logging;
mod output;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use channel::wire::{Request, Response};
use channel::{ConnectionManager, ProcessSpawner, RemoteHandle};
use config::Config;
use worker::WorkerArgs;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    if args.first().map(String::as_str) == Some("--worker") {
        return worker_main(&args[1..]);
    }
    controller_main(&args)
}

fn worker_main(args: &[String]) -> Result<()> {
    let worker_args = parse_worker_args(args)?;
    let _guard = logging::init_worker(worker_args.debuggable)?;
    info!(session = %worker_args.session, "worker starting");

    let config = Config::load()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(worker::run(worker_args, config))
}

fn parse_worker_args(args: &[String]) -> Result<WorkerArgs> {
    let mut socket = None;
    let mut session = None;
    let mut daemon = false;
    let mut debuggable = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" => {
                socket = Some(PathBuf::from(
                    iter.next().context("--socket requires a path")?,
                ));
            }
            "--session" => {
                session = Some(iter.next().context("--session requires a token")?.clone());
            }
            "--daemon" => daemon = true,
            "--debuggable" => debuggable = true,
            other => bail!("unknown worker argument: {other}"),
        }
    }

    Ok(WorkerArgs {
        socket: socket.context("--worker requires --socket")?,
        session: session.context("--worker requires --session")?,
        daemon,
        debuggable,
    })
}

fn controller_main(args: &[String]) -> Result<()> {
    logging::init_controller();
    let config = Config::load()?;
    let command = args.first().map(String::as_str).unwrap_or("run");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match command {
            "version" => {
                let (manager, handle) = connect(&config).await?;
                if let Response::Text { value: Some(block) } =
                    handle.call(&Request::Version).await?
                {
                    println!("{block}");
                }
                finish(&manager, &config).await;
                Ok(())
            }
            "setup" => {
                let (manager, handle) = connect(&config).await?;
                let setup = Request::Setup {
                    user_dir: config.engine.user_dir.clone(),
                };
                let ready = handle.call(&setup).await?.bool_value();
                println!("setup: {}", if ready { "ok" } else { "failed" });
                finish(&manager, &config).await;
                Ok(())
            }
            "start" => {
                let (manager, handle) = connect(&config).await?;
                handle
                    .call(&Request::Setup {
                        user_dir: config.engine.user_dir.clone(),
                    })
                    .await?;
                match handle.call(&Request::StartCapture).await? {
                    Response::Int { value } if value >= 0 => println!("capturing, output {value}"),
                    _ => warn!("capture did not start"),
                }
                if !config.channel.daemon {
                    warn!("worker is not a daemon, capture stops when the controller exits");
                }
                finish(&manager, &config).await;
                Ok(())
            }
            "stop" => {
                let (manager, handle) = connect(&config).await?;
                handle.call(&Request::StopCapture).await?;
                println!("capture stopped");
                finish(&manager, &config).await;
                Ok(())
            }
            "screenshot" => {
                let output = args
                    .get(1)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("screenshot.raw"));
                let (manager, handle) = connect(&config).await?;
                handle
                    .call(&Request::Setup {
                        user_dir: config.engine.user_dir.clone(),
                    })
                    .await?;
                match handle.call(&Request::GetImage).await? {
                    Response::Frame { frame: Some(frame) } => {
                        let data = frame.consume()?;
                        std::fs::write(&output, &data)
                            .with_context(|| format!("failed to write {output:?}"))?;
                        println!("wrote {} bytes to {}", data.len(), output.display());
                    }
                    _ => bail!("no image available"),
                }
                finish(&manager, &config).await;
                Ok(())
            }
            "run" => run_controller(&config).await,
            other => {
                print_help();
                bail!("unknown command: {other}");
            }
        }
    })
}

/// Interactive mode: bind, capture, and hold until interrupted.
async fn run_controller(config: &Config) -> Result<()> {
    let (manager, handle) = connect(config).await?;
    handle
        .call(&Request::Setup {
            user_dir: config.engine.user_dir.clone(),
        })
        .await?;
    match handle.call(&Request::StartCapture).await? {
        Response::Int { value } if value >= 0 => info!("capturing on output {value}"),
        _ => warn!("capture did not start"),
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install interrupt handler")?;

    let _ = rx.recv().await;
    info!("interrupted, shutting down");

    if let Some(handle) = manager.get_instance_or_null().await {
        let _ = handle.call(&Request::StopCapture).await;
    }
    manager.unbind().await;
    Ok(())
}

async fn connect(config: &Config) -> Result<(ConnectionManager, RemoteHandle)> {
    let spawner = Arc::new(ProcessSpawner::new(config.channel.runtime_dir()?));
    let manager = ConnectionManager::new(
        spawner,
        config.channel.connect_timeout(),
        config.channel.daemon,
        config.channel.debuggable,
    );
    manager.bind().await?;
    let handle = manager
        .get_instance(config.channel.connect_timeout())
        .await?;
    Ok((manager, handle))
}

/// Tear the binding down unless the worker is meant to outlive us.
async fn finish(manager: &ConnectionManager, config: &Config) {
    if !config.channel.daemon {
        manager.unbind().await;
    }
}

fn print_help() {
    println!(
        "screenpilot - privileged automation controller

USAGE:
    screenpilot [COMMAND]

COMMANDS:
    run                 bind the worker and capture until interrupted (default)
    version             print controller, engine, and instance versions
    setup               initialize the automation engine
    start               start capturing on the configured output
    stop                stop capturing
    screenshot [PATH]   export the current frame to PATH (default screenshot.raw)

OPTIONS:
    -h, --help          print this help

The worker process is spawned internally with --worker and is not meant
to be started by hand."
    );
}
