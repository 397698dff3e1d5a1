use thiserror::Error;

/// Error taxonomy for one reconciliation pass.
///
/// `SourceFetch`, `DirectoryFetch` and `TemplateMissing` abort the pass;
/// everything else is per-item, logged, aggregated into the pass outcome,
/// and corrected on the next pass by re-reading ground truth.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch pull requests for {owner}/{repo}")]
    SourceFetch {
        owner: String,
        repo: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to list bots on server {server}")]
    DirectoryFetch {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("template bot {name:?} not found on server {server}")]
    TemplateMissing { server: String, name: String },

    #[error("failed to create bot {name} for PR #{number}")]
    BotCreate {
        number: u64,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to delete bot {name} on server {server}")]
    BotDelete {
        name: String,
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to poll status of bot {name}")]
    StatusPoll {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to report status for PR #{number} at {sha}")]
    StatusWrite {
        number: u64,
        sha: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("status store error")]
    Store(#[source] anyhow::Error),
}

impl SyncError {
    /// Whether this error aborts the current pass rather than one item.
    pub fn is_pass_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceFetch { .. } | Self::DirectoryFetch { .. } | Self::TemplateMissing { .. }
        )
    }
}
