use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};

pub const DEFAULT_RPC_PORT: u16 = 50051;
pub const DEFAULT_MIN_PORT: u16 = 50100;
pub const DEFAULT_MAX_PORT: u16 = 51000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub bot: BotConfig,
    pub plugins: PluginManagerConfig,
    pub admin: AdminConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            bot: BotConfig::default(),
            plugins: PluginManagerConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the upstream gateway's HTTP action API.
    pub http_url: String,
    /// Websocket endpoint of the gateway's event stream. The host itself
    /// does not dial it; events arrive through the event intake.
    pub ws_url: String,
    pub token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_url: "http://127.0.0.1:3000".to_string(),
            ws_url: "ws://127.0.0.1:3001".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub command_prefix: String,
    pub admins: Vec<i64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            command_prefix: "/".to_string(),
            admins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManagerConfig {
    /// Directory holding downloaded plugin executables.
    pub plugin_dir: PathBuf,
    /// Directory holding one metadata JSON file per installed plugin.
    pub config_dir: PathBuf,
    /// Port the host's BotService listens on for plugin callbacks.
    pub rpc_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub auto_start: Vec<String>,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        let base = data_root();
        Self {
            plugin_dir: base.join("plugins").join("bin"),
            config_dir: base.join("plugins").join("meta"),
            rpc_port: DEFAULT_RPC_PORT,
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            auto_start: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the given path, or the default location, falling back to
    /// built-in defaults when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.bot.admins.contains(&user_id)
    }

    fn validate(&self) -> Result<()> {
        if self.plugins.min_port > self.plugins.max_port {
            return Err(BotError::Config(format!(
                "plugin port range is inverted ({} > {})",
                self.plugins.min_port, self.plugins.max_port
            )));
        }
        if self.bot.command_prefix.is_empty() {
            return Err(BotError::Config("command_prefix must not be empty".into()));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("botplane")
        .join("config.toml")
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".botplane")
}
