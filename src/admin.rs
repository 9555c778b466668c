use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    dispatcher::Dispatcher,
    error::{BotError, Result},
    installer::Installer,
    message::MessageEvent,
    registry::PluginRegistry,
    supervisor::Supervisor,
};

/// Uniform admin envelope: `code` is 0 on success and -1 on failure.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminResponse {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AdminResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(err: &BotError) -> Self {
        Self {
            code: -1,
            message: err.to_string(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Imperative control surface invoked by the admin HTTP layer (and by the
/// operator's tooling). Every operation returns the uniform envelope.
pub struct AdminApi {
    registry: Arc<PluginRegistry>,
    supervisor: Arc<Supervisor>,
    installer: Arc<Installer>,
    dispatcher: Arc<Dispatcher>,
}

impl AdminApi {
    pub fn new(
        registry: Arc<PluginRegistry>,
        supervisor: Arc<Supervisor>,
        installer: Arc<Installer>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            installer,
            dispatcher,
        }
    }

    pub fn list(&self) -> AdminResponse {
        let plugins = self.registry.list();
        match serde_json::to_value(&plugins) {
            Ok(data) => AdminResponse::ok_with("success", data),
            Err(err) => AdminResponse::error(&err.into()),
        }
    }

    pub async fn install(&self, repo_url: &str, auto_start: bool) -> AdminResponse {
        let meta = match self.installer.install(repo_url).await {
            Ok(meta) => meta,
            Err(err) => return AdminResponse::error(&err),
        };
        self.registry.insert_meta(meta.clone());

        let summary = |started: bool| {
            json!({
                "name": meta.name,
                "version": meta.version,
                "started": started,
            })
        };

        if !auto_start {
            return AdminResponse::ok_with("plugin installed", summary(false));
        }
        match self.supervisor.start(&meta.name).await {
            Ok(()) => AdminResponse::ok_with("plugin installed and started", summary(true)),
            Err(err) => AdminResponse::ok_with(
                format!("plugin installed but failed to start: {err}"),
                summary(false),
            ),
        }
    }

    pub async fn start(&self, name: &str) -> AdminResponse {
        match self.supervisor.start(name).await {
            Ok(()) => AdminResponse::ok("plugin started"),
            Err(err) => AdminResponse::error(&err),
        }
    }

    pub async fn stop(&self, name: &str) -> AdminResponse {
        match self.supervisor.stop(name).await {
            Ok(()) => AdminResponse::ok("plugin stopped"),
            Err(err) => AdminResponse::error(&err),
        }
    }

    pub async fn uninstall(&self, name: &str) -> AdminResponse {
        match self.supervisor.uninstall(name).await {
            Ok(()) => AdminResponse::ok("plugin uninstalled"),
            Err(err) => AdminResponse::error(&err),
        }
    }

    pub fn health(&self) -> AdminResponse {
        AdminResponse::ok_with(
            "ok",
            json!({
                "status": "healthy",
                "running_plugins": self.registry.running_names().len(),
            }),
        )
    }

    /// Gateway event push intake. Non-message payloads are acknowledged
    /// and dropped.
    pub async fn dispatch_event(&self, payload: Value) -> AdminResponse {
        if payload.get("post_type").and_then(Value::as_str) != Some("message") {
            return AdminResponse::ok("ignored");
        }
        let event: MessageEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(err) => return AdminResponse::error(&err.into()),
        };
        let handled = self.dispatcher.dispatch(&event).await;
        AdminResponse::ok_with("dispatched", json!({ "handled": handled }))
    }
}

#[derive(Deserialize)]
struct InstallRequest {
    repo_url: String,
    #[serde(default)]
    auto_start: bool,
}

#[derive(Deserialize)]
struct NameRequest {
    name: String,
}

pub fn router(api: Arc<AdminApi>) -> Router {
    Router::new()
        .route("/api/plugins", get(handle_list))
        .route("/api/plugins/install", post(handle_install))
        .route("/api/plugins/start", post(handle_start))
        .route("/api/plugins/stop", post(handle_stop))
        .route("/api/plugins/uninstall", post(handle_uninstall))
        .route("/api/health", get(handle_health))
        .route("/api/events", post(handle_event))
        .layer(TraceLayer::new_for_http())
        .with_state(api)
}

pub async fn serve(listener: TcpListener, api: Arc<AdminApi>) -> Result<()> {
    info!(
        target: "botplane.admin",
        "admin API listening on {}",
        listener.local_addr()?
    );
    axum::serve(listener, router(api)).await.map_err(BotError::Io)
}

fn envelope(response: AdminResponse) -> (StatusCode, Json<AdminResponse>) {
    let status = if response.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response))
}

async fn handle_list(State(api): State<Arc<AdminApi>>) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.list())
}

async fn handle_install(
    State(api): State<Arc<AdminApi>>,
    Json(request): Json<InstallRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    if request.repo_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(AdminResponse {
                code: -1,
                message: "repo_url is required".to_string(),
                data: None,
            }),
        );
    }
    envelope(api.install(&request.repo_url, request.auto_start).await)
}

async fn handle_start(
    State(api): State<Arc<AdminApi>>,
    Json(request): Json<NameRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.start(&request.name).await)
}

async fn handle_stop(
    State(api): State<Arc<AdminApi>>,
    Json(request): Json<NameRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.stop(&request.name).await)
}

async fn handle_uninstall(
    State(api): State<Arc<AdminApi>>,
    Json(request): Json<NameRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.uninstall(&request.name).await)
}

async fn handle_health(State(api): State<Arc<AdminApi>>) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.health())
}

async fn handle_event(
    State(api): State<Arc<AdminApi>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<AdminResponse>) {
    envelope(api.dispatch_event(payload).await)
}
