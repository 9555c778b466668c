use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tonic::transport::Channel;
use tracing::warn;

use crate::{
    error::{BotError, Result},
    port::PortPool,
    proto::plugin_service_client::PluginServiceClient,
};

pub type PluginClient = PluginServiceClient<Channel>;

/// Metadata a plugin reports about itself, persisted at install time and
/// immutable until uninstall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub handle_all_messages: bool,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub binary_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Stopped,
    Running,
    Error,
}

impl PluginStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

struct PluginState {
    info: PluginMeta,
    status: PluginStatus,
    process: Option<Child>,
    port: Option<u16>,
    channel: Option<PluginClient>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl PluginState {
    fn stopped(info: PluginMeta) -> Self {
        Self {
            info,
            status: PluginStatus::Stopped,
            process: None,
            port: None,
            channel: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Cloneable view of a plugin's state for listing and admin responses.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    #[serde(flatten)]
    pub info: PluginMeta,
    pub status: PluginStatus,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Runtime resources extracted from the registry when a plugin leaves the
/// running state. The caller tears these down outside the registry lock.
pub struct RuntimeHandle {
    pub child: Option<Child>,
    pub channel: Option<PluginClient>,
    pub port: u16,
}

struct RegistryInner {
    plugins: HashMap<String, PluginState>,
    command_index: HashMap<String, String>,
}

/// Authoritative in-memory table of known plugins. A single RW lock guards
/// the plugin map and the derived command index; the port pool is updated
/// inside the same critical section so a plugin can never be observed
/// running without its port leased, or stopped with a port still held.
/// No outbound I/O happens under the lock.
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
    ports: Arc<PortPool>,
}

impl PluginRegistry {
    pub fn new(ports: Arc<PortPool>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                plugins: HashMap::new(),
                command_index: HashMap::new(),
            }),
            ports,
        }
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Registers installed metadata without starting anything. A running
    /// plugin keeps its live state; its metadata is refreshed on the next
    /// start.
    pub fn insert_meta(&self, meta: PluginMeta) {
        let mut inner = self.inner.write();
        match inner.plugins.entry(meta.name.clone()) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if state.status != PluginStatus::Running {
                    state.info = meta;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PluginState::stopped(meta));
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().plugins.contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<PluginStatus> {
        self.inner.read().plugins.get(name).map(|state| state.status)
    }

    pub fn get(&self, name: &str) -> Option<PluginSummary> {
        self.inner.read().plugins.get(name).map(summarize)
    }

    pub fn list(&self) -> Vec<PluginSummary> {
        let inner = self.inner.read();
        let mut summaries: Vec<PluginSummary> = inner.plugins.values().map(summarize).collect();
        summaries.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        summaries
    }

    /// Snapshot of running plugins with cloned RPC clients, taken under the
    /// read lock so dispatch never holds the lock across an RPC.
    pub fn all_running(&self) -> Vec<(String, PluginClient)> {
        let inner = self.inner.read();
        inner
            .plugins
            .iter()
            .filter(|(_, state)| state.status == PluginStatus::Running)
            .filter_map(|(name, state)| {
                state
                    .channel
                    .clone()
                    .map(|client| (name.clone(), client))
            })
            .collect()
    }

    pub fn running_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .plugins
            .iter()
            .filter(|(_, state)| state.status == PluginStatus::Running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn find_by_command(&self, command: &str) -> Option<(String, PluginClient)> {
        let inner = self.inner.read();
        let name = inner.command_index.get(command)?;
        let state = inner.plugins.get(name)?;
        if state.status != PluginStatus::Running {
            return None;
        }
        state.channel.clone().map(|client| (name.clone(), client))
    }

    /// All commands claimed by running plugins, keyed by command keyword.
    pub fn all_commands(&self) -> BTreeMap<String, PluginMeta> {
        let inner = self.inner.read();
        let mut commands = BTreeMap::new();
        for (command, name) in &inner.command_index {
            if let Some(state) = inner.plugins.get(name) {
                if state.status == PluginStatus::Running {
                    commands.insert(command.clone(), state.info.clone());
                }
            }
        }
        commands
    }

    /// Commits a successful start over an existing stopped or errored
    /// entry. Fails with `AlreadyRunning` when a concurrent start won the
    /// race, and with `PluginNotFound` when the entry is gone (a concurrent
    /// uninstall removed it mid-start); either way the caller rolls back
    /// the spawned process and port, and an uninstalled plugin is never
    /// resurrected.
    pub fn set_running(
        &self,
        meta: PluginMeta,
        child: Child,
        port: u16,
        client: PluginClient,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.plugins.get(&meta.name) {
            None => return Err(BotError::PluginNotFound(meta.name)),
            Some(state) if state.status == PluginStatus::Running => {
                return Err(BotError::AlreadyRunning(meta.name));
            }
            Some(_) => {}
        }

        let name = meta.name.clone();
        for command in &meta.commands {
            if let Some(previous) = inner
                .command_index
                .insert(command.clone(), name.clone())
            {
                if previous != name {
                    warn!(
                        target: "botplane.registry",
                        "command '{}' re-registered by {}, previously owned by {}",
                        command, name, previous
                    );
                }
            }
        }

        inner.plugins.insert(
            name,
            PluginState {
                info: meta,
                status: PluginStatus::Running,
                process: Some(child),
                port: Some(port),
                channel: Some(client),
                started_at: Some(Utc::now()),
                last_error: None,
            },
        );
        Ok(())
    }

    /// Demotes a running plugin to stopped, atomically dropping its commands
    /// from the index and returning its port to the pool. The extracted
    /// runtime handle is shut down by the caller outside the lock.
    pub fn take_for_stop(&self, name: &str) -> Result<RuntimeHandle> {
        let mut inner = self.inner.write();
        let state = inner
            .plugins
            .get_mut(name)
            .ok_or_else(|| BotError::PluginNotFound(name.to_string()))?;
        if state.status != PluginStatus::Running {
            return Err(BotError::NotRunning(name.to_string()));
        }

        let child = state.process.take();
        let channel = state.channel.take();
        let port = state.port.take().unwrap_or_default();
        state.status = PluginStatus::Stopped;
        state.started_at = None;
        state.last_error = None;

        Self::unindex_commands(&mut inner, name);
        self.ports.release(port);

        Ok(RuntimeHandle {
            child,
            channel,
            port,
        })
    }

    /// Marks a running plugin as crashed. Returns the extracted runtime
    /// handle, or `None` when the plugin was not running (a stop raced the
    /// health probe).
    pub fn mark_error(&self, name: &str, message: &str) -> Option<RuntimeHandle> {
        let mut inner = self.inner.write();
        let state = inner.plugins.get_mut(name)?;
        if state.status != PluginStatus::Running {
            return None;
        }

        let child = state.process.take();
        let channel = state.channel.take();
        let port = state.port.take().unwrap_or_default();
        state.status = PluginStatus::Error;
        state.started_at = None;
        state.last_error = Some(message.to_string());

        Self::unindex_commands(&mut inner, name);
        self.ports.release(port);

        Some(RuntimeHandle {
            child,
            channel,
            port,
        })
    }

    pub fn record_error(&self, name: &str, message: &str) {
        let mut inner = self.inner.write();
        if let Some(state) = inner.plugins.get_mut(name) {
            state.last_error = Some(message.to_string());
        }
    }

    /// Drops the plugin from the registry entirely. The caller is expected
    /// to have stopped it first; a still-running entry is demoted on the way
    /// out so the index and pool stay consistent.
    pub fn remove(&self, name: &str) -> Option<RuntimeHandle> {
        let mut inner = self.inner.write();
        let state = inner.plugins.remove(name)?;
        Self::unindex_commands(&mut inner, name);

        if state.status == PluginStatus::Running {
            if let Some(port) = state.port {
                self.ports.release(port);
            }
            return Some(RuntimeHandle {
                child: state.process,
                channel: state.channel,
                port: state.port.unwrap_or_default(),
            });
        }
        None
    }

    fn unindex_commands(inner: &mut RegistryInner, name: &str) {
        inner.command_index.retain(|_, owner| owner.as_str() != name);
    }
}

fn summarize(state: &PluginState) -> PluginSummary {
    PluginSummary {
        info: state.info.clone(),
        status: state.status,
        port: state.port,
        started_at: state.started_at,
        last_error: state.last_error.clone(),
    }
}

pub fn meta_path(config_dir: &Path, name: &str) -> PathBuf {
    config_dir.join(format!("{name}.json"))
}

pub fn load_meta(path: &Path) -> Result<PluginMeta> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_meta(config_dir: &Path, meta: &PluginMeta) -> Result<PathBuf> {
    fs::create_dir_all(config_dir)?;
    let path = meta_path(config_dir, &meta.name);
    let payload = serde_json::to_string_pretty(meta)?;
    fs::write(&path, payload)?;
    Ok(path)
}

/// Every metadata file under the config directory; unreadable entries are
/// skipped.
pub fn scan_config_dir(config_dir: &Path) -> Vec<PluginMeta> {
    let mut metas = Vec::new();
    let entries = match fs::read_dir(config_dir) {
        Ok(entries) => entries,
        Err(_) => return metas,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match load_meta(&path) {
            Ok(meta) => metas.push(meta),
            Err(err) => {
                warn!(
                    target: "botplane.registry",
                    "skipping unreadable plugin metadata {}: {}",
                    path.display(),
                    err
                );
            }
        }
    }
    metas.sort_by(|a, b| a.name.cmp(&b.name));
    metas
}
