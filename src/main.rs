use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{info, warn};

use botplane::{
    admin::{self, AdminApi},
    config::Config,
    dispatcher::Dispatcher,
    gateway::{HttpGateway, MessageSender},
    hostrpc::BotService,
    installer::Installer,
    logging,
    port::PortPool,
    registry::PluginRegistry,
    supervisor::Supervisor,
};

#[derive(Parser)]
#[command(author, version, about = "botplane chat-bot host")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/botplane/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host: BotService RPC, plugin supervision, admin API
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured BotService RPC port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Override the configured admin listen address
    #[arg(long)]
    admin_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(cli.config, args).await,
    }
}

async fn start(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    logging::init()?;

    let mut config =
        Config::load_or_default(config_path.as_deref()).context("failed to load configuration")?;
    if let Some(rpc_port) = args.rpc_port {
        config.plugins.rpc_port = rpc_port;
    }
    if let Some(admin_addr) = args.admin_addr {
        config.admin.listen_addr = admin_addr;
    }

    fs::create_dir_all(&config.plugins.plugin_dir)
        .context("failed to create plugin directory")?;
    fs::create_dir_all(&config.plugins.config_dir)
        .context("failed to create plugin config directory")?;

    let ports = Arc::new(PortPool::new(
        config.plugins.min_port,
        config.plugins.max_port,
    ));
    let registry = Arc::new(PluginRegistry::new(ports));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&registry), &config.plugins));
    let installer = Arc::new(
        Installer::new(&config.plugins.plugin_dir, &config.plugins.config_dir)
            .context("failed to build installer")?,
    );
    let sender: Arc<dyn MessageSender> =
        Arc::new(HttpGateway::new(&config.gateway).context("failed to build gateway client")?);
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        config.bot.command_prefix.clone(),
    ));

    // The callback surface must be up before any plugin starts; a bind
    // failure here is fatal.
    let rpc_addr: SocketAddr = ([127, 0, 0, 1], config.plugins.rpc_port).into();
    let rpc_listener = TcpListener::bind(rpc_addr)
        .await
        .with_context(|| format!("failed to bind BotService RPC port {rpc_addr}"))?;
    info!("BotService RPC listening on {rpc_addr}");
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(BotService::new(sender).into_server())
            .serve_with_incoming(TcpListenerStream::new(rpc_listener))
            .await;
        if let Err(err) = result {
            warn!("BotService RPC server error: {err}");
        }
    });

    supervisor.load_installed();
    let health_task = Arc::clone(&supervisor).spawn_health_loop();
    supervisor.auto_start(&config.plugins.auto_start).await;

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.listen_addr)
            .await
            .with_context(|| {
                format!("failed to bind admin address {}", config.admin.listen_addr)
            })?;
        let api = Arc::new(AdminApi::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            installer,
            Arc::clone(&dispatcher),
        ));
        tokio::spawn(async move {
            if let Err(err) = admin::serve(admin_listener, api).await {
                warn!("admin server error: {err}");
            }
        });
    }

    info!("botplane host started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    supervisor.shutdown().await;
    health_task.abort();
    Ok(())
}
