pub mod config;
pub mod error;
pub mod models;
pub mod naming;
pub mod status;
pub mod util;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Bot, BotStatus, CommitState, PullRequest};

/// Read access to the open pull requests of a tracked repository.
#[async_trait]
pub trait PullSource: Send + Sync {
    async fn open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>>;
}

/// The CI server's bot inventory and per-bot operations.
///
/// Every method is a fresh remote read or a single remote mutation; nothing
/// is cached between calls, so a failed mutation is corrected on the next
/// reconciliation pass by re-reading ground truth.
#[async_trait]
pub trait BotDirectory: Send + Sync {
    fn server_name(&self) -> &str;

    async fn bots(&self) -> Result<Vec<Bot>>;

    /// Duplicate `template` as a new bot named `name` building `branch`.
    async fn duplicate_bot(&self, template: &Bot, name: &str, branch: &str) -> Result<Bot>;

    async fn start_integration(&self, bot: &Bot) -> Result<()>;

    /// Status of the bot's most recent integration. A bot that has never
    /// integrated reports a pending/unknown status rather than an error.
    async fn status(&self, bot: &Bot) -> Result<BotStatus>;

    async fn delete_bot(&self, bot: &Bot) -> Result<()>;
}

/// Write access to commit statuses and PR comments on the hosting service.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn set_status(
        &self,
        pr: &PullRequest,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()>;

    async fn add_comment(&self, pr: &PullRequest, body: &str) -> Result<()>;
}
