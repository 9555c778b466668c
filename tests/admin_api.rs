use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use axum::{extract::Path as AxumPath, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use botplane::{
    admin::{self, AdminApi},
    dispatcher::Dispatcher,
    installer::{platform_suffix, Installer},
    port::PortPool,
    registry::PluginRegistry,
    supervisor::Supervisor,
};

fn plugin_binary() -> &'static str {
    env!("CARGO_BIN_EXE_plugin-echo")
}

/// Stand-in for the GitHub API: one release whose single asset is the
/// compiled echo plugin binary.
async fn spawn_release_server() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind release server")?;
    let addr = listener.local_addr()?;
    let base = format!("http://{addr}");

    let asset_name = format!("plugin-echo_{}", platform_suffix());
    let release = json!({
        "tag_name": "v1.0.0",
        "assets": [{
            "name": asset_name,
            "browser_download_url": format!("{base}/download/{asset_name}"),
        }],
    });

    let app = Router::new()
        .route(
            "/repos/acme/plugin-echo/releases/latest",
            get(move || {
                let release = release.clone();
                async move { Json(release) }
            }),
        )
        .route(
            "/download/:name",
            get(|AxumPath(_name): AxumPath<String>| async {
                fs::read(plugin_binary()).expect("plugin binary readable")
            }),
        );

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(base)
}

struct Harness {
    base_url: String,
    client: reqwest::Client,
    plugin_dir: std::path::PathBuf,
    config_dir: std::path::PathBuf,
    _tempdir: tempfile::TempDir,
}

async fn spawn_admin_stack(min_port: u16, max_port: u16) -> Result<Harness> {
    let tempdir = tempfile::tempdir()?;
    let plugin_dir = tempdir.path().join("bin");
    let config_dir = tempdir.path().join("meta");

    let config = botplane::config::PluginManagerConfig {
        plugin_dir: plugin_dir.clone(),
        config_dir: config_dir.clone(),
        rpc_port: 50051,
        min_port,
        max_port,
        auto_start: Vec::new(),
    };

    let ports = Arc::new(PortPool::new(config.min_port, config.max_port));
    let registry = Arc::new(PluginRegistry::new(ports));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&registry), &config));
    let release_base = spawn_release_server().await?;
    let installer = Arc::new(
        Installer::new(&plugin_dir, &config_dir)
            .context("failed to build installer")?
            .with_api_base(release_base),
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), "/"));

    let api = Arc::new(AdminApi::new(registry, supervisor, installer, dispatcher));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind admin listener")?;
    let base_url = format!("http://{}", listener.local_addr()?);
    tokio::spawn(async move {
        let _ = admin::serve(listener, api).await;
    });

    Ok(Harness {
        base_url,
        client: reqwest::Client::new(),
        plugin_dir,
        config_dir,
        _tempdir: tempdir,
    })
}

impl Harness {
    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Ok(response.json().await?)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn install_list_uninstall_round_trip() -> Result<()> {
    let harness = spawn_admin_stack(52400, 52410).await?;

    let installed = harness
        .post(
            "/api/plugins/install",
            json!({ "repo_url": "https://github.com/acme/plugin-echo", "auto_start": false }),
        )
        .await?;
    assert_eq!(installed["code"], 0, "install failed: {installed}");
    assert_eq!(installed["data"]["name"], "echo");
    assert_eq!(installed["data"]["started"], false);

    let binary = harness
        .plugin_dir
        .join(format!("plugin-echo_{}", platform_suffix()));
    assert!(binary.exists(), "downloaded binary missing");
    assert!(harness.config_dir.join("echo.json").exists());

    let listed = harness.get("/api/plugins").await?;
    assert_eq!(listed["code"], 0);
    let plugins = listed["data"].as_array().context("list data not array")?;
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["name"], "echo");
    assert_eq!(plugins[0]["status"], "stopped");

    let removed = harness
        .post("/api/plugins/uninstall", json!({ "name": "echo" }))
        .await?;
    assert_eq!(removed["code"], 0);
    assert!(!binary.exists());
    assert!(!harness.config_dir.join("echo.json").exists());

    let listed = harness.get("/api/plugins").await?;
    assert_eq!(listed["data"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn install_with_auto_start_then_uninstall_while_running() -> Result<()> {
    let harness = spawn_admin_stack(52420, 52430).await?;

    let installed = harness
        .post(
            "/api/plugins/install",
            json!({ "repo_url": "https://github.com/acme/plugin-echo", "auto_start": true }),
        )
        .await?;
    assert_eq!(installed["code"], 0, "install failed: {installed}");
    assert_eq!(installed["data"]["started"], true);

    let health = harness.get("/api/health").await?;
    assert_eq!(health["data"]["running_plugins"], 1);

    let removed = harness
        .post("/api/plugins/uninstall", json!({ "name": "echo" }))
        .await?;
    assert_eq!(removed["code"], 0);

    let health = harness.get("/api/health").await?;
    assert_eq!(health["data"]["running_plugins"], 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn errors_use_the_failure_envelope() -> Result<()> {
    let harness = spawn_admin_stack(52440, 52450).await?;

    let stop = harness
        .post("/api/plugins/stop", json!({ "name": "ghost" }))
        .await?;
    assert_eq!(stop["code"], -1);
    assert!(stop["message"]
        .as_str()
        .context("message not a string")?
        .contains("ghost"));

    let start = harness
        .post("/api/plugins/start", json!({ "name": "ghost" }))
        .await?;
    assert_eq!(start["code"], -1);

    let install = harness
        .post(
            "/api/plugins/install",
            json!({ "repo_url": "https://example.com/not-github" }),
        )
        .await?;
    assert_eq!(install["code"], -1);

    let missing = harness
        .post("/api/plugins/install", json!({ "repo_url": "" }))
        .await?;
    assert_eq!(missing["code"], -1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn event_intake_ignores_non_message_payloads() -> Result<()> {
    let harness = spawn_admin_stack(52460, 52470).await?;

    let notice = harness
        .post("/api/events", json!({ "post_type": "notice" }))
        .await?;
    assert_eq!(notice["code"], 0);
    assert_eq!(notice["message"], "ignored");

    let message = harness
        .post(
            "/api/events",
            json!({
                "post_type": "message",
                "message_type": "private",
                "message_id": 5,
                "user_id": 42,
                "raw_message": "hello",
                "message": [],
                "sender": { "user_id": 42, "nickname": "alice" },
                "time": 1722400000,
            }),
        )
        .await?;
    assert_eq!(message["code"], 0);
    assert_eq!(message["data"]["handled"], false);
    Ok(())
}
