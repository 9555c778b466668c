use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Notify,
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

use crate::{
    config::PluginManagerConfig,
    error::{BotError, Result},
    proto,
    registry::{
        load_meta, meta_path, scan_config_dir, PluginClient, PluginRegistry, PluginStatus,
        RuntimeHandle,
    },
};

const STARTUP_ATTEMPTS: u32 = 10;
const STARTUP_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(3);
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Owns the lifecycle of every external plugin process: spawn and
/// handshake, graceful stop with kill escalation, periodic liveness
/// probing with a single bounded restart per crash, and host shutdown.
pub struct Supervisor {
    registry: Arc<PluginRegistry>,
    plugin_dir: PathBuf,
    config_dir: PathBuf,
    /// Address plugins use to reach the host's BotService.
    core_addr: String,
    stop_health: Notify,
    /// In-flight crash-restart tasks, drained and aborted on shutdown so a
    /// pending restart can never spawn a plugin after the host has stopped.
    restart_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(registry: Arc<PluginRegistry>, config: &PluginManagerConfig) -> Self {
        Self {
            registry,
            plugin_dir: config.plugin_dir.clone(),
            config_dir: config.config_dir.clone(),
            core_addr: format!("127.0.0.1:{}", config.rpc_port),
            stop_health: Notify::new(),
            restart_tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Registers every installed plugin as stopped without starting it.
    pub fn load_installed(&self) {
        for meta in scan_config_dir(&self.config_dir) {
            debug!(
                target: "botplane.supervisor",
                "registered installed plugin {} v{}", meta.name, meta.version
            );
            self.registry.insert_meta(meta);
        }
    }

    pub async fn auto_start(&self, names: &[String]) {
        for name in names {
            if let Err(err) = self.start(name).await {
                warn!(
                    target: "botplane.supervisor",
                    "failed to auto-start {}: {}", name, err
                );
            }
        }
    }

    /// Starts a registered plugin: lease a port, spawn the binary,
    /// handshake over RPC with bounded retries, then commit the running
    /// state. No partial state survives a failure at any step.
    pub async fn start(&self, name: &str) -> Result<()> {
        match self.registry.status(name) {
            Some(PluginStatus::Running) => {
                return Err(BotError::AlreadyRunning(name.to_string()));
            }
            Some(_) => {}
            None => return Err(BotError::PluginNotFound(name.to_string())),
        }

        let meta = load_meta(&meta_path(&self.config_dir, name))
            .map_err(|_| BotError::PluginNotFound(name.to_string()))?;

        let binary_path = self.plugin_dir.join(&meta.binary_name);
        if !binary_path.exists() {
            return Err(BotError::BinaryMissing(binary_path));
        }

        let port = self.registry.ports().acquire()?;

        let mut child = match spawn_plugin(&binary_path, name, port, &self.core_addr) {
            Ok(child) => child,
            Err(err) => {
                self.registry.ports().release(port);
                return Err(err);
            }
        };

        let client = match self.handshake(name, port).await {
            Ok(client) => client,
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.registry.ports().release(port);
                return Err(err);
            }
        };

        // A concurrent start may have won while the lock was released for
        // the spawn and handshake; the loser rolls back like any failure.
        if let Err(err) = self.registry.set_running(meta, child, port, client) {
            self.registry.ports().release(port);
            return Err(err);
        }

        info!(
            target: "botplane.supervisor",
            "started plugin {} on port {}", name, port
        );
        Ok(())
    }

    /// Dials the freshly spawned plugin until both the connection and a
    /// health probe succeed, or the retry budget runs out.
    async fn handshake(&self, name: &str, port: u16) -> Result<PluginClient> {
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .map_err(|err| BotError::Rpc(err.to_string()))?
            .connect_timeout(DIAL_TIMEOUT);

        for attempt in 1..=STARTUP_ATTEMPTS {
            sleep(STARTUP_RETRY_INTERVAL).await;

            let channel = match endpoint.connect().await {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(
                        target: "botplane.supervisor",
                        "dial attempt {}/{} for {} failed: {}",
                        attempt, STARTUP_ATTEMPTS, name, err
                    );
                    continue;
                }
            };

            let mut client = PluginClient::new(channel);
            match timeout(HANDSHAKE_HEALTH_TIMEOUT, client.health(proto::Empty {})).await {
                Ok(Ok(ref reply)) if reply.get_ref().healthy => return Ok(client),
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                    debug!(
                        target: "botplane.supervisor",
                        "health attempt {}/{} for {} not ready",
                        attempt, STARTUP_ATTEMPTS, name
                    );
                }
            }
        }

        Err(BotError::StartupTimeout {
            name: name.to_string(),
            attempts: STARTUP_ATTEMPTS,
        })
    }

    /// Stops a running plugin: the registry demotion (status, command
    /// index, port) commits atomically first, then the process is asked to
    /// shut down and force-killed if it lingers.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let handle = self.registry.take_for_stop(name)?;
        teardown(name, handle, true).await;
        info!(target: "botplane.supervisor", "stopped plugin {}", name);
        Ok(())
    }

    /// Stops the plugin if running, then removes its binary, metadata, and
    /// registry entry.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        match self.stop(name).await {
            Ok(()) => {}
            Err(BotError::NotRunning(_)) | Err(BotError::PluginNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let meta_file = meta_path(&self.config_dir, name);
        if let Ok(meta) = load_meta(&meta_file) {
            let binary_path = self.plugin_dir.join(&meta.binary_name);
            if let Err(err) = std::fs::remove_file(&binary_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        target: "botplane.supervisor",
                        "failed to remove binary {}: {}", binary_path.display(), err
                    );
                }
            }
        }
        match std::fs::remove_file(&meta_file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(handle) = self.registry.remove(name) {
            teardown(name, handle, false).await;
        }

        info!(target: "botplane.supervisor", "uninstalled plugin {}", name);
        Ok(())
    }

    /// Probes every running plugin on a fixed tick until host shutdown.
    pub fn spawn_health_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + HEALTH_INTERVAL, HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.stop_health.notified() => break,
                    _ = ticker.tick() => Self::check_plugin_health(&self).await,
                }
            }
        })
    }

    async fn check_plugin_health(supervisor: &Arc<Self>) {
        for (name, mut client) in supervisor.registry.all_running() {
            let probe = timeout(HEALTH_PROBE_TIMEOUT, client.health(proto::Empty {})).await;
            let failure = match probe {
                Ok(Ok(ref reply)) if reply.get_ref().healthy => None,
                Ok(Ok(_)) => Some("plugin reported unhealthy".to_string()),
                Ok(Err(status)) => Some(format!("health probe failed: {}", status.message())),
                Err(_) => Some("health probe timed out".to_string()),
            };
            if let Some(reason) = failure {
                warn!(
                    target: "botplane.supervisor",
                    "plugin {} failed health check: {}", name, reason
                );
                Self::handle_crash(supervisor, &name, &reason);
            }
        }
    }

    /// Demotes a crashed plugin to error and schedules exactly one restart
    /// attempt. A failed restart stays in error until an operator
    /// intervenes; the next tick will not retry.
    fn handle_crash(supervisor: &Arc<Self>, name: &str, reason: &str) {
        let Some(handle) = supervisor.registry.mark_error(name, reason) else {
            return;
        };

        let restarter = Arc::clone(supervisor);
        let name = name.to_string();
        let task = tokio::spawn(async move {
            if let Some(mut child) = handle.child {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            drop(handle.channel);

            sleep(RESTART_DELAY).await;
            info!(
                target: "botplane.supervisor",
                "attempting restart of crashed plugin {}", name
            );
            match restarter.start(&name).await {
                Ok(()) => {
                    info!(
                        target: "botplane.supervisor",
                        "successfully restarted plugin {}", name
                    );
                }
                Err(err) => {
                    warn!(
                        target: "botplane.supervisor",
                        "failed to restart plugin {}: {}", name, err
                    );
                    restarter.registry.record_error(&name, &err.to_string());
                }
            }
        });

        // Registered under the drain lock so a probe racing shutdown cannot
        // slip a restart past the reaper.
        let mut tasks = supervisor.restart_tasks.lock();
        if supervisor.shutting_down.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Host shutdown: stop the health loop, cancel any pending crash
    /// restarts, then stop every running plugin.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop_health.notify_waiters();

        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.restart_tasks.lock());
        for task in pending {
            task.abort();
            let _ = task.await;
        }

        for name in self.registry.running_names() {
            if let Err(err) = self.stop(&name).await {
                warn!(
                    target: "botplane.supervisor",
                    "failed to stop {} during shutdown: {}", name, err
                );
            }
        }
    }
}

fn spawn_plugin(binary_path: &PathBuf, name: &str, port: u16, core_addr: &str) -> Result<Child> {
    let mut child = Command::new(binary_path)
        .arg("--port")
        .arg(port.to_string())
        .arg("--core-addr")
        .arg(core_addr)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            BotError::Config(format!("failed to start plugin {name}: {err}"))
        })?;

    if let Some(stdout) = child.stdout.take() {
        spawn_stream_logger(name.to_string(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_stream_logger(name.to_string(), "stderr", stderr);
    }
    Ok(child)
}

/// Best-effort teardown of an extracted runtime handle. Graceful stops
/// signal a shutdown RPC and give the process a bounded window to exit;
/// otherwise the process is killed outright.
async fn teardown(name: &str, handle: RuntimeHandle, graceful: bool) {
    if graceful {
        if let Some(mut client) = handle.channel {
            let _ = timeout(SHUTDOWN_RPC_TIMEOUT, client.shutdown(proto::Empty {})).await;
        }
    }

    if let Some(mut child) = handle.child {
        if graceful {
            match timeout(EXIT_WAIT_TIMEOUT, child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    debug!(
                        target: "botplane.supervisor",
                        "plugin {} did not exit in time, killing", name
                    );
                }
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

fn spawn_stream_logger<R>(name: String, channel: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim_end();
            if !trimmed.is_empty() {
                info!(target: "botplane.plugin", "{} {}: {}", name, channel, trimmed);
            }
        }
    });
}
