use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use healthmesh::collector::{JobCollector, MasterClient, Prober};
use healthmesh::config::Config;
use healthmesh::server::MasterServer;

#[derive(Parser)]
#[command(
    name = "healthmesh",
    version,
    about = "Distributed endpoint health checking with flap-suppressed alarms",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: tree watchers, job pool, job store and policy center
    Master {
        /// Override the HTTP bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Start as standby; the policy center stays idle
        #[arg(long, default_value = "false")]
        standby: bool,
    },

    /// Run a slave collector against a master
    Slave {
        /// Override the master URL
        #[arg(short, long)]
        master: Option<String>,

        /// Override the cluster name this slave reports under
        #[arg(long)]
        cluster: Option<String>,

        /// Override the served zones (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        zones: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "healthmesh starting");
    if let Err(e) = healthmesh::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_ctrl_c(shutdown.clone()));

    match cli.command {
        Commands::Master { bind, standby } => {
            if let Some(bind) = bind {
                config.master.bind_address = bind;
            }
            if standby {
                config.master.is_master = false;
            }
            config.master.validate()?;

            tracing::info!(
                bind = %config.master.bind_address,
                is_master = config.master.is_master,
                "Starting master command"
            );
            run_master(config, shutdown).await?;
        }

        Commands::Slave { master, cluster, zones } => {
            if let Some(master) = master {
                config.slave.master_url = master;
            }
            if let Some(cluster) = cluster {
                config.slave.cluster_name = cluster;
            }
            if !zones.is_empty() {
                config.slave.zones = zones.iter().map(|z| healthmesh::Zone::new(z.trim())).collect();
            }
            config.slave.validate()?;

            tracing::info!(
                master = %config.slave.master_url,
                cluster = %config.slave.cluster_name,
                zones = ?config.slave.zones,
                "Starting slave command"
            );
            run_slave(config, shutdown).await?;
        }
    }

    tracing::info!("healthmesh stopped");
    Ok(())
}

async fn watch_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::warn!(error = %e, "Failed to listen for ctrl-c, shutting down"),
    }
    shutdown.cancel();
}

async fn run_master(config: Config, shutdown: CancellationToken) -> Result<()> {
    let server = MasterServer::from_config(config.master)
        .await
        .context("Failed to initialize master")?;

    let token = server.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        token.cancel();
    });

    server.serve().await.context("Master server failed")?;
    Ok(())
}

async fn run_slave(config: Config, shutdown: CancellationToken) -> Result<()> {
    let slave = config.slave.slave_info();
    let client = MasterClient::new(config.slave.client_config()).context("Failed to build master client")?;
    let prober = Prober::from_config(&config.slave.collector).context("Failed to build prober")?;

    let collector = Arc::new(JobCollector::new(slave, Arc::new(client), prober, &config.slave.collector));
    collector.run(shutdown).await;
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("healthmesh=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("healthmesh={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
