use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use brokerd::{config::Config, context::Context, metrics::Metrics, server};

#[derive(Parser, Debug)]
#[command(name = "brokerd")]
#[command(about = "Hardware-accelerator VF passthrough management daemon")]
struct Args {
    /// Path to config file.
    #[arg(long, value_name = "PATH", env = "ACCEL_BROKER_CONFIG")]
    config: Option<PathBuf>,
    /// Override the section-partitioning policy from the config file.
    #[arg(long)]
    policy: Option<u32>,
    /// Put every discovered VF into a single static section.
    #[arg(long)]
    static_cfg: bool,
    /// Override the socket path from the config file.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Rebase the sysfs paths the discovery pipeline reads (not
    /// `/dev/vfio`) under this root, for containerized or relocated
    /// sysfs mounts.
    #[arg(long, value_name = "PATH")]
    sysfs_root: Option<PathBuf>,
    /// Keep each VF's passthrough group file descriptor open for the
    /// daemon's lifetime instead of closing it after enumeration.
    #[arg(long)]
    retain_group_handles: bool,
    /// Raise the log level; repeatable (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.config {
        unsafe {
            std::env::set_var("ACCEL_BROKER_CONFIG", path);
        }
    }
    let mut config = Config::load();
    if let Some(policy) = args.policy {
        config.sections.policy = policy;
    }
    if args.static_cfg {
        config.sections.static_cfg = true;
    }
    if let Some(socket) = &args.socket {
        config.server.socket_path = socket.clone();
    }
    if let Some(root) = &args.sysfs_root {
        config.paths.rebase_sysfs(root);
    }
    if args.retain_group_handles {
        config.sections.retain_group_handles = true;
    }

    log::info!("starting broker daemon");
    let ctx = Arc::new(Context::build(&config).map_err(|e| {
        log::error!("failed to build broker context: {e:#}");
        e
    })?);
    log::info!("discovery complete: {} sections", ctx.registry.len());

    let metrics = Arc::new(Metrics::new());

    let socket_path = config.server.socket_path.clone();
    let server_metrics = Arc::clone(&metrics);
    let server_ctx = Arc::clone(&ctx);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::run(&socket_path, server_ctx, server_metrics).await {
            log::error!("server loop exited: {e:#}");
        }
    });

    install_sigterm_handler();
    log::info!("running; press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    log::info!("shutting down: {}", metrics.summary());

    server_task.abort();
    Ok(())
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    if verbose > 0 {
        let level = if verbose == 1 { log::LevelFilter::Debug } else { log::LevelFilter::Trace };
        builder.filter_level(level);
    }
    builder.init();
}

fn install_sigterm_handler() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
        sigterm.recv().await;
        log::info!("SIGTERM received, exiting");
        std::process::exit(0);
    });
}
