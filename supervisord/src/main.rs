//! Binary front-end: parses startup flags, daemonizes, constructs a
//! `Supervisor` over a sys-folder, and serves the control listener until a
//! termination signal arrives.

mod control;

use std::io::stderr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use daemon::Daemonize;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use supervisor_core::{GoBuildPreparable, NativeProcess, Preparable, SupervisedProcess, Supervisor};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(version, about = "Builds, launches, and supervises a named collection of child processes")]
struct Args {
    /// Directory holding config.toml and every supervised process's artifacts
    #[clap(long, default_value = "/tmp/supervisord")]
    sys_folder: PathBuf,

    /// Path to the `go` binary used to build `Gobin` requests
    #[clap(long, default_value = "go")]
    go_binary: PathBuf,

    /// Unix socket the control listener binds; defaults to `<sys_folder>/control.sock`
    #[clap(long)]
    socket: Option<PathBuf>,

    #[clap(flatten)]
    daemonize: Daemonize,

    /// File to write logs to; stderr if omitted
    #[clap(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(log_file) = &args.log_file {
        let writer = std::fs::OpenOptions::new().create(true).append(true).open(log_file)?;
        tracing_subscriber::fmt().with_writer(writer).with_ansi(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(stderr)
            .with_ansi(unsafe { libc::isatty(libc::STDERR_FILENO) } == 1)
            .init();
    }

    // Must happen before the tokio runtime spins up worker threads: forking
    // after other threads exist is unsafe (see `daemon::Daemonize`).
    let (daemonizing, _cleanup) = unsafe { args.daemonize.clone().start() };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async_main(args, daemonizing))
}

async fn async_main(args: Args, daemonizing: daemon::Daemonizing) -> Result<()> {
    std::fs::create_dir_all(&args.sys_folder)
        .with_context(|| format!("{}: could not create sys folder", args.sys_folder.display()))?;

    let config_path = args.sys_folder.join("config.toml");
    if std::fs::metadata(&config_path).is_err() {
        std::fs::write(&config_path, "").with_context(|| format!("{}: could not create empty config", config_path.display()))?;
    }

    let preparable: Arc<dyn Preparable> = Arc::new(GoBuildPreparable {
        go_binary: args.go_binary.clone(),
    });
    let process_factory = Arc::new(|| Arc::new(NativeProcess::new()) as Arc<dyn SupervisedProcess>);

    let supervisor = Supervisor::init(
        args.sys_folder.clone(),
        args.sys_folder.join("main.pid"),
        args.sys_folder.join("main.out"),
        args.sys_folder.join("main.err"),
        preparable,
        process_factory,
    )
    .await
    .context("failed to initialize supervisor")?;

    supervisor.spawn_background_tasks();
    info!(sys_folder = %supervisor.sys_folder().display(), "supervisor initialized");

    daemonizing.finish();

    let socket_path = args.socket.unwrap_or_else(|| args.sys_folder.join("control.sock"));
    let shutdown = spawn_signal_listener()?;

    tokio::select! {
        result = control::serve(&socket_path, supervisor.clone()) => {
            result.context("control listener failed")?;
        }
        _ = shutdown => {
            info!("termination signal received, shutting down");
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

/// Registers SIGINT/SIGTERM/SIGQUIT on a dedicated OS thread (signal-hook's
/// iterator API is blocking) and resolves once the first one arrives.
fn spawn_signal_listener() -> Result<tokio::sync::oneshot::Receiver<()>> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM, SIGQUIT]).context("failed to register signal handlers")?;
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        for signal in signals.forever() {
            warn!(signal, "caught termination signal");
            let _ = tx.send(());
            break;
        }
    });

    Ok(rx)
}
