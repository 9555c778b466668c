use std::sync::Arc;

use tracing::{debug, warn};

use crate::{message::MessageEvent, proto, registry::PluginRegistry};

/// Routes incoming chat events: a prefixed command goes to the unique
/// plugin owning the keyword, everything else fans out to every running
/// plugin concurrently.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    command_prefix: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>, command_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            command_prefix: command_prefix.into(),
        }
    }

    /// Entry point for the gateway's event stream. Returns whether a
    /// command dispatch was handled; broadcasts always report false since
    /// they are fire-and-forget.
    pub async fn dispatch(&self, event: &MessageEvent) -> bool {
        let text = event.raw_message.trim();
        if let Some(rest) = text.strip_prefix(&self.command_prefix) {
            let mut parts = rest.split_whitespace();
            let Some(command) = parts.next() else {
                return false;
            };
            let args: Vec<String> = parts.map(str::to_string).collect();
            return self.dispatch_command(event, command, args).await;
        }

        self.broadcast(event);
        false
    }

    /// Exactly one `OnCommand` RPC goes out, to the index owner; an
    /// unclaimed keyword is reported unhandled.
    pub async fn dispatch_command(
        &self,
        event: &MessageEvent,
        command: &str,
        args: Vec<String>,
    ) -> bool {
        let Some((name, mut client)) = self.registry.find_by_command(command) else {
            debug!(
                target: "botplane.dispatcher",
                "no plugin registered for command '{}'", command
            );
            return false;
        };

        let request = proto::CommandEvent {
            message: Some(event.to_proto()),
            command: command.to_string(),
            args,
        };

        match client.on_command(request).await {
            Ok(reply) => reply.into_inner().handled,
            Err(status) => {
                warn!(
                    target: "botplane.dispatcher",
                    "plugin {} OnCommand error: {}", name, status.message()
                );
                false
            }
        }
    }

    /// Fans the event out to a snapshot of the running set. Each RPC runs
    /// on its own task; individual failures are logged and dropped.
    pub fn broadcast(&self, event: &MessageEvent) {
        let recipients = self.registry.all_running();
        let proto_event = event.to_proto();

        for (name, mut client) in recipients {
            let request = proto_event.clone();
            tokio::spawn(async move {
                if let Err(status) = client.on_message(request).await {
                    warn!(
                        target: "botplane.dispatcher",
                        "plugin {} OnMessage error: {}", name, status.message()
                    );
                }
            });
        }
    }
}
