use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{header::ACCEPT, Client, StatusCode};
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use crate::{
    error::{BotError, Result},
    registry::{save_meta, PluginMeta},
};

const USER_AGENT: &str = concat!("botplane/", env!("CARGO_PKG_VERSION"));
const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_URL_PREFIX: &str = "https://github.com/";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RELEASE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Downloads release binaries from GitHub, probes them for self-reported
/// metadata, and persists that metadata. Never touches running processes;
/// stopping a plugin before re-install is the caller's job.
pub struct Installer {
    client: Client,
    plugin_dir: PathBuf,
    config_dir: PathBuf,
    api_base: String,
}

impl Installer {
    pub fn new(plugin_dir: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| BotError::Download(err.to_string()))?;
        Ok(Self {
            client,
            plugin_dir: plugin_dir.into(),
            config_dir: config_dir.into(),
            api_base: GITHUB_API_BASE.to_string(),
        })
    }

    /// Points the release queries at a different API host (GitHub
    /// Enterprise, or a stand-in server under test).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn install(&self, repo_url: &str) -> Result<PluginMeta> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let release = self.fetch_latest_release(&owner, &repo).await?;

        let suffix = platform_suffix();
        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name.contains(&suffix))
            .ok_or_else(|| BotError::NoCompatibleBinary {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            })?;

        info!(
            target: "botplane.installer",
            "downloading {} ({}) for {}/{}",
            asset.name, release.tag_name, owner, repo
        );

        fs::create_dir_all(&self.plugin_dir)?;
        let binary_path = self.plugin_dir.join(&asset.name);
        self.download(&asset.browser_download_url, &binary_path)
            .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&binary_path, fs::Permissions::from_mode(0o755))?;
        }

        let mut meta = match probe_binary(&binary_path).await {
            Ok(meta) => meta,
            Err(err) => {
                let _ = fs::remove_file(&binary_path);
                return Err(err);
            }
        };
        meta.repo_url = repo_url.to_string();
        meta.binary_name = asset.name.clone();

        save_meta(&self.config_dir, &meta)?;

        info!(
            target: "botplane.installer",
            "installed plugin {} v{}", meta.name, meta.version
        );
        Ok(meta)
    }

    async fn fetch_latest_release(&self, owner: &str, repo: &str) -> Result<GithubRelease> {
        let url = format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo);
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(RELEASE_QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|err| BotError::Download(format!("failed to fetch release info: {err}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(BotError::Download(format!(
                "no releases found for {owner}/{repo}"
            )));
        }
        let response = response
            .error_for_status()
            .map_err(|err| BotError::Download(format!("release index query failed: {err}")))?;

        response
            .json()
            .await
            .map_err(|err| BotError::Download(format!("failed to parse release info: {err}")))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BotError::Download(err.to_string()))?
            .error_for_status()
            .map_err(|err| BotError::Download(err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BotError::Download(err.to_string()))?;
        fs::write(dest, &bytes)?;
        Ok(())
    }
}

/// Runs the binary with `--info` and parses the JSON metadata it prints.
pub async fn probe_binary(path: &Path) -> Result<PluginMeta> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(path).arg("--info").kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| BotError::ProbeFailed("metadata query timed out".into()))?
    .map_err(|err| BotError::ProbeFailed(err.to_string()))?;

    if !output.status.success() {
        return Err(BotError::ProbeFailed(format!(
            "metadata query exited with {}",
            output.status
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|err| BotError::ProbeFailed(format!("invalid metadata JSON: {err}")))
}

/// Splits a `https://github.com/owner/repo` URL into its owner/repo pair.
pub fn parse_repo_url(repo_url: &str) -> Result<(String, String)> {
    let rest = repo_url
        .strip_prefix(GITHUB_URL_PREFIX)
        .ok_or_else(|| BotError::InvalidRepoUrl(repo_url.to_string()))?;
    let mut parts = rest.split('/').filter(|part| !part.is_empty());
    let owner = parts.next();
    let repo = parts.next();
    match (owner, repo) {
        (Some(owner), Some(repo)) => Ok((
            owner.to_string(),
            repo.trim_end_matches(".git").to_string(),
        )),
        _ => Err(BotError::InvalidRepoUrl(repo_url.to_string())),
    }
}

/// Release assets embed a `<os>_<arch>` suffix in Go toolchain spelling,
/// plus `.exe` on windows.
pub fn platform_suffix() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    let mut suffix = format!("{}_{}", std::env::consts::OS, arch);
    if std::env::consts::OS == "windows" {
        suffix.push_str(".exe");
    }
    suffix
}
