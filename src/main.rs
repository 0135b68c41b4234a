//! `bbque` daemon entry point: parse flags, resolve configuration, wire
//! every subsystem into an [`bbque::RtrmContext`], and run the control
//! loop until a clean or aborted exit.
//!
//! Grounded on the teacher's `main.rs`: `clap::Parser` for flags,
//! `anyhow::Result` at the process boundary, `tracing-subscriber` set up
//! from `RUST_LOG` before anything else runs.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bbque::config::{Args, DaemonConfig};
use bbque::resource_manager::{LoopExit, BBQ_ABORT, BBQ_EXIT, EXC_START};
use bbque::RtrmContext;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolve the future that completes when the daemon should react to an
/// OS signal, spec.md §6: `SIGINT` clean exit, `SIGQUIT` immediate abort,
/// `SIGUSR1`/`SIGUSR2` user events (here: wake a scheduling cycle).
#[cfg(unix)]
async fn run_signal_loop(ctx: &RtrmContext) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to register SIGUSR1 handler");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("failed to register SIGUSR2 handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received, requesting clean shutdown");
                ctx.resource_manager.notify_event(BBQ_EXIT).await;
                return;
            }
            _ = sigquit.recv() => {
                warn!("SIGQUIT received, aborting immediately");
                ctx.resource_manager.notify_event(BBQ_ABORT).await;
                return;
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received, requesting a scheduling cycle");
                ctx.resource_manager.notify_event(EXC_START).await;
            }
            _ = sigusr2.recv() => {
                info!("SIGUSR2 received, requesting a scheduling cycle");
                ctx.resource_manager.notify_event(EXC_START).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_signal_loop(ctx: &RtrmContext) {
    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl-C received, requesting clean shutdown");
    ctx.resource_manager.notify_event(BBQ_EXIT).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = DaemonConfig::from_args(&args);
    info!(
        config = %config.config_path.display(),
        plugins = %config.plugins_dir.display(),
        scheduler_policy = %config.scheduler_policy,
        sync_policy = %config.sync_policy,
        "bbque starting"
    );

    let ctx = RtrmContext::build(config).map_err(|e| {
        error!(error = %e, "platform resource registration failed");
        anyhow::anyhow!(e).context("failed to build resource manager context")
    })?;

    let shutdown = std::sync::Arc::new(tokio::sync::Notify::new());
    let monitor_task = tokio::spawn({
        let monitor = ctx.platform_monitor.clone();
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    let control_loop = tokio::spawn({
        let resource_manager = ctx.resource_manager.clone();
        async move { resource_manager.run().await }
    });

    run_signal_loop(&ctx).await;

    let exit = control_loop.await.context("control loop task panicked")?;
    shutdown.notify_one();
    let _ = monitor_task.await;

    match exit {
        LoopExit::Clean => {
            info!("bbque exiting cleanly");
            Ok(())
        }
        LoopExit::Aborted => {
            error!("bbque aborted");
            #[cfg(unix)]
            std::process::exit(libc::EXIT_FAILURE);
            #[cfg(not(unix))]
            std::process::exit(1);
        }
    }
}
