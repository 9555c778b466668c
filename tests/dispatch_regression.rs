use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
    transport::{Channel, Server},
    Request, Response, Status,
};

use botplane::{
    dispatcher::Dispatcher,
    message::{MessageEvent, MessageKind, Sender},
    port::PortPool,
    proto::{
        self,
        plugin_service_client::PluginServiceClient,
        plugin_service_server::{PluginService, PluginServiceServer},
    },
    registry::{PluginMeta, PluginRegistry},
};

#[derive(Debug, Clone)]
enum PluginCall {
    Command {
        command: String,
        args: Vec<String>,
        user_id: i64,
    },
    Message {
        raw_message: String,
    },
}

struct RecordingPlugin {
    calls: mpsc::Sender<PluginCall>,
}

#[tonic::async_trait]
impl PluginService for RecordingPlugin {
    async fn get_info(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::PluginInfo>, Status> {
        Ok(Response::new(proto::PluginInfo::default()))
    }

    async fn on_message(
        &self,
        request: Request<proto::MessageEvent>,
    ) -> std::result::Result<Response<proto::HandledReply>, Status> {
        let event = request.into_inner();
        let _ = self
            .calls
            .send(PluginCall::Message {
                raw_message: event.raw_message,
            })
            .await;
        Ok(Response::new(proto::HandledReply { handled: false }))
    }

    async fn on_command(
        &self,
        request: Request<proto::CommandEvent>,
    ) -> std::result::Result<Response<proto::HandledReply>, Status> {
        let event = request.into_inner();
        let user_id = event.message.map(|m| m.user_id).unwrap_or_default();
        let _ = self
            .calls
            .send(PluginCall::Command {
                command: event.command,
                args: event.args,
                user_id,
            })
            .await;
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
        Ok(Response::new(proto::Empty {}))
    }
}

async fn spawn_plugin_server(
) -> Result<(PluginServiceClient<Channel>, mpsc::Receiver<PluginCall>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind plugin listener")?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(PluginServiceServer::new(RecordingPlugin { calls: tx }))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    let client = PluginServiceClient::connect(format!("http://{addr}"))
        .await
        .context("failed to connect to plugin server")?;
    Ok((client, rx))
}

fn test_meta(name: &str, commands: &[&str]) -> PluginMeta {
    PluginMeta {
        name: name.to_string(),
        version: "0.1.0".to_string(),
        description: String::new(),
        author: String::new(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
        handle_all_messages: false,
        repo_url: String::new(),
        binary_name: format!("{name}_linux_amd64"),
    }
}

async fn register_running(
    registry: &PluginRegistry,
    name: &str,
    commands: &[&str],
) -> Result<mpsc::Receiver<PluginCall>> {
    let (client, rx) = spawn_plugin_server().await?;
    let child = Command::new("sleep")
        .arg("60")
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn placeholder process")?;
    registry.insert_meta(test_meta(name, commands));
    let port = registry.ports().acquire()?;
    registry.set_running(test_meta(name, commands), child, port, client)?;
    Ok(rx)
}

fn private_event(raw_message: &str) -> MessageEvent {
    MessageEvent {
        time: 1_722_400_000,
        post_type: "message".to_string(),
        message_type: MessageKind::Private,
        message_id: 7,
        user_id: 42,
        group_id: 0,
        raw_message: raw_message.to_string(),
        segments: Vec::new(),
        sender: Sender {
            user_id: 42,
            nickname: "alice".to_string(),
            ..Sender::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn command_goes_to_the_unique_owner() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo", "say"]).await?;
    let mut weather_rx = register_running(&registry, "weather", &["weather"]).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "/");
    let handled = dispatcher.dispatch(&private_event("/echo hi there")).await;
    assert!(handled);

    let call = echo_rx.recv().await.context("echo got no call")?;
    match call {
        PluginCall::Command {
            command,
            args,
            user_id,
        } => {
            assert_eq!(command, "echo");
            assert_eq!(args, vec!["hi".to_string(), "there".to_string()]);
            assert_eq!(user_id, 42);
        }
        other => panic!("unexpected call: {other:?}"),
    }

    assert!(echo_rx.try_recv().is_err(), "echo saw a second call");
    assert!(weather_rx.try_recv().is_err(), "weather was touched");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_is_not_handled() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo"]).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "/");
    let handled = dispatcher.dispatch(&private_event("/weather beijing")).await;
    assert!(!handled);
    assert!(echo_rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bare_prefix_is_ignored() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo"]).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "/");
    assert!(!dispatcher.dispatch(&private_event("/")).await);
    assert!(!dispatcher.dispatch(&private_event("/   ")).await);

    sleep(Duration::from_millis(100)).await;
    assert!(echo_rx.try_recv().is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_reaches_every_running_plugin_once() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo"]).await?;
    let mut weather_rx = register_running(&registry, "weather", &["weather"]).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "/");
    let handled = dispatcher.dispatch(&private_event("hello everyone")).await;
    assert!(!handled);

    for rx in [&mut echo_rx, &mut weather_rx] {
        let call = timeout(Duration::from_secs(2), rx.recv())
            .await
            .context("broadcast did not arrive")?
            .context("plugin channel closed")?;
        match call {
            PluginCall::Message { raw_message } => assert_eq!(raw_message, "hello everyone"),
            other => panic!("unexpected call: {other:?}"),
        }
    }

    sleep(Duration::from_millis(100)).await;
    assert!(echo_rx.try_recv().is_err(), "echo saw a duplicate broadcast");
    assert!(weather_rx.try_recv().is_err(), "weather saw a duplicate broadcast");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_skips_stopped_plugins() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo"]).await?;
    let mut weather_rx = register_running(&registry, "weather", &["weather"]).await?;

    let mut handle = registry.take_for_stop("echo")?;
    if let Some(child) = handle.child.as_mut() {
        let _ = child.start_kill();
    }

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "/");
    dispatcher.dispatch(&private_event("anyone there?")).await;

    let call = timeout(Duration::from_secs(2), weather_rx.recv())
        .await
        .context("broadcast did not arrive")?
        .context("plugin channel closed")?;
    assert!(matches!(call, PluginCall::Message { .. }));

    sleep(Duration::from_millis(100)).await;
    assert!(echo_rx.try_recv().is_err(), "stopped plugin got a broadcast");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_prefix_is_honored() -> Result<()> {
    let registry = Arc::new(PluginRegistry::new(Arc::new(PortPool::new(50100, 50120))));
    let mut echo_rx = register_running(&registry, "echo", &["echo"]).await?;

    let dispatcher = Dispatcher::new(Arc::clone(&registry), "!");
    assert!(dispatcher.dispatch(&private_event("!echo hey")).await);

    let call = echo_rx.recv().await.context("echo got no call")?;
    assert!(matches!(call, PluginCall::Command { .. }));
    Ok(())
}
