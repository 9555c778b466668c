//! Reference external plugin: echoes command arguments back to the chat.
//! Doubles as the end-to-end fixture for the supervisor tests.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::Notify;
use tonic::{transport::Server, Request, Response, Status};

use botplane::proto::{
    self,
    bot_service_client::BotServiceClient,
    plugin_service_server::{PluginService, PluginServiceServer},
};

const NAME: &str = "echo";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(about = "echo plugin for the botplane host")]
struct Cli {
    /// Print plugin metadata as JSON and exit
    #[arg(long)]
    info: bool,

    /// Port to serve the plugin RPC endpoint on
    #[arg(long)]
    port: Option<u16>,

    /// Address of the host's BotService
    #[arg(long, default_value = "127.0.0.1:50051")]
    core_addr: String,
}

struct EchoPlugin {
    core_addr: String,
    shutdown: std::sync::Arc<Notify>,
}

impl EchoPlugin {
    fn info() -> proto::PluginInfo {
        proto::PluginInfo {
            name: NAME.to_string(),
            version: VERSION.to_string(),
            description: "echoes command arguments back to the sender".to_string(),
            author: "botplane".to_string(),
            commands: vec!["echo".to_string(), "say".to_string()],
            handle_all_messages: false,
        }
    }
}

#[tonic::async_trait]
impl PluginService for EchoPlugin {
    async fn get_info(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::PluginInfo>, Status> {
        Ok(Response::new(Self::info()))
    }

    async fn on_message(
        &self,
        _request: Request<proto::MessageEvent>,
    ) -> std::result::Result<Response<proto::HandledReply>, Status> {
        Ok(Response::new(proto::HandledReply { handled: false }))
    }

    async fn on_command(
        &self,
        request: Request<proto::CommandEvent>,
    ) -> std::result::Result<Response<proto::HandledReply>, Status> {
        let event = request.into_inner();
        let Some(message) = event.message else {
            return Ok(Response::new(proto::HandledReply { handled: false }));
        };

        let text = event.args.join(" ");
        let segments = vec![proto::MessageSegment {
            r#type: "text".to_string(),
            data: [("text".to_string(), text)].into_iter().collect(),
        }];

        match BotServiceClient::connect(format!("http://{}", self.core_addr)).await {
            Ok(mut core) => {
                let result = core
                    .send_message(proto::SendMessageRequest {
                        message_type: message.message_type.clone(),
                        user_id: message.user_id,
                        group_id: message.group_id,
                        segments,
                    })
                    .await;
                if let Err(status) = result {
                    eprintln!("echo: SendMessage failed: {}", status.message());
                }
            }
            Err(err) => eprintln!("echo: cannot reach host at {}: {err}", self.core_addr),
        }

        Ok(Response::new(proto::HandledReply { handled: true }))
    }

    async fn health(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::HealthReply>, Status> {
        Ok(Response::new(proto::HealthReply {
            healthy: true,
            status: "ok".to_string(),
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::Empty>, Status> {
        self.shutdown.notify_one();
        Ok(Response::new(proto::Empty {}))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.info {
        let info = EchoPlugin::info();
        println!(
            "{}",
            json!({
                "name": info.name,
                "version": info.version,
                "description": info.description,
                "author": info.author,
                "commands": info.commands,
                "handle_all_messages": info.handle_all_messages,
            })
        );
        return Ok(());
    }

    let port = cli.port.context("--port is required")?;
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let shutdown = std::sync::Arc::new(Notify::new());

    let plugin = EchoPlugin {
        core_addr: cli.core_addr,
        shutdown: shutdown.clone(),
    };

    Server::builder()
        .add_service(PluginServiceServer::new(plugin))
        .serve_with_shutdown(addr, async move { shutdown.notified().await })
        .await
        .context("plugin RPC server failed")?;
    Ok(())
}
