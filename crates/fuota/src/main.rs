use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::{info, warn};

use ns_client::{ChirpStackClient, ChirpStackConfig, NetworkServerClient};
use storage::{DeploymentStore, PgConfig, PgStore};

use fuota::api::{self, DeploymentServiceImpl};
use fuota::config::Config;
use fuota::eventhandler::EventRouter;

#[derive(Parser)]
#[command(
    name = "fuota-server",
    version,
    about = "FUOTA deployment server for LoRaWAN device fleets"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "fuota-server.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the FUOTA server (default).
    Start,

    /// Print a configuration file template and exit.
    Configfile,

    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => run(config).await,
        Commands::Configfile => {
            print!("{}", config.template());
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting FUOTA server");

    let store: Arc<dyn DeploymentStore> = Arc::new(
        PgStore::connect(&PgConfig {
            dsn: config.postgresql.dsn.clone(),
            automigrate: config.postgresql.automigrate,
            max_open_connections: config.postgresql.max_open_connections,
            max_idle_connections: config.postgresql.max_idle_connections,
        })
        .await?,
    );

    let client: Arc<dyn NetworkServerClient> = Arc::new(
        ChirpStackClient::connect(&ChirpStackConfig {
            server: config.network_server.api.server.clone(),
            api_token: config.network_server.api.token.clone(),
            tls_enabled: config.network_server.api.tls_enabled,
        })
        .await?,
    );

    let router = EventRouter::new(
        config.network_server.event_handler.marshaler,
        client.clone(),
    );

    let event_bind: SocketAddr = config.network_server.event_handler.bind.parse()?;
    let event_handler = tokio::spawn(router.clone().serve(event_bind));

    let api_bind: SocketAddr = config.fuota_server.api.bind.parse()?;
    let service = DeploymentServiceImpl::new(store, client, router);

    tokio::select! {
        res = api::serve(
            api_bind,
            &config.fuota_server.api.ca_cert,
            &config.fuota_server.api.tls_cert,
            &config.fuota_server.api.tls_key,
            service,
        ) => {
            res?;
        }
        res = event_handler => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("signal received, stopping");
        }
    }

    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.general.log_level)?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if config.general.log_to_syslog {
        warn!("log_to_syslog is set but syslog output is not supported, logging to stderr");
    }

    Ok(())
}
