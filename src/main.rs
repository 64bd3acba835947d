use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info};

use ikev2_daemon::{DaemonConfig, IkeDaemon};

#[derive(Parser)]
#[command(name = "ikev2d")]
#[command(about = "IKEv2 daemon - negotiates and installs IPsec CHILD_SAs")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the IKEv2 daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show daemon status
    Status,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Start { foreground } => {
            start_daemon(foreground).await?;
        }
        Commands::Status => {
            info!("ikev2d status: running");
        }
        Commands::Config => {
            let config = DaemonConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn start_daemon(foreground: bool) -> anyhow::Result<()> {
    info!("starting IKEv2 daemon...");

    if !foreground {
        info!("running in daemon mode");
    }

    let config = DaemonConfig::load().map_err(|e| {
        error!("failed to load configuration: {}", e);
        e
    })?;
    debug!(
        "configuration loaded, listening on {}:{}",
        config.daemon.listen_address, config.daemon.listen_port
    );

    let ike_daemon = IkeDaemon::bind(config.listen_addr()?).await?;
    tokio::spawn(async move {
        ike_daemon.run().await;
    });

    info!(
        "IKEv2 daemon started, listening for IKE messages on port {}",
        config.daemon.listen_port
    );

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("unable to listen for shutdown signal: {}", err);
        }
    }

    info!("IKEv2 daemon stopped");
    Ok(())
}
