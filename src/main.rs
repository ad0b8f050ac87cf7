use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use warden::amnesty::AmnestyStore;
use warden::config::Config;
use warden::moderation::ModerationStore;
use warden::process::ServerProcess;
use warden::supervisor::{ProcessCommandSink, Supervisor};

/// Supervise a game server process and moderate its players
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Game server supervisor with automatic moderation", long_about = None)]
struct Cli {
    /// Command line used to launch the server (run through `sh -c`)
    #[arg(value_name = "COMMAND")]
    server_command: String,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("warden started with verbosity level: {}", cli.verbose);

    if let Err(e) = run(&cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> warden::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    for file in [&config.player_file, &config.banned_file, &config.forbidden_file, &config.request_file] {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let process = Arc::new(ServerProcess::new(
        &cli.server_command,
        config.output_poll_interval,
    ));
    let moderation = Arc::new(ModerationStore::new(
        &config.player_file,
        &config.banned_file,
        &config.forbidden_file,
        Arc::new(ProcessCommandSink::new(Arc::clone(&process))),
    ));
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&process),
        Arc::clone(&moderation),
        config.log_cache_capacity,
        config.output_poll_interval,
    ));
    let amnesty = Arc::new(AmnestyStore::new(
        &config.request_file,
        &config.upload_dir,
        config.vote_threshold,
        config.request_retention,
        Arc::clone(&supervisor) as Arc<dyn warden::amnesty::RequestExecutor>,
    ));
    amnesty.set_player_check(Arc::clone(&moderation) as Arc<dyn warden::amnesty::PlayerCheck>);

    supervisor.start()?;
    moderation.start_expiry_sweep(config.ban_sweep_interval);
    amnesty.start_sweep(config.vote_sweep_interval);
    info!(command = %cli.server_command, "server under supervision");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    amnesty.shutdown().await;
    moderation.shutdown().await;
    supervisor.stop().await;
    process.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
