use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

/// The Xcode server hosting the bots.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Network name of the server.
    pub name: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Bound on every remote call; a timeout is a transient failure, not
    /// fatal to the process.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub url: String,
    /// Reported-status records older than this behave as absent.
    #[serde(default = "default_expiration_days")]
    pub expiration_days: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { url: "sqlite:xcbot.db".to_string(), expiration_days: default_expiration_days() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Name of the pre-configured bot duplicated to create per-PR bots.
    pub template_bot: String,
    /// Compute and log the convergence plan without any create/delete/report
    /// side effects.
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds to wait between passes in repeat mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Bound on concurrent per-PR actions within a pass.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_timeout_secs() -> u64 { 30 }

fn default_expiration_days() -> u64 { 30 }

fn default_interval_secs() -> u64 { 60 }

fn default_concurrency() -> usize { 4 }
