use std::{fmt, str::FromStr};

use time::{Duration, UtcDateTime};

use crate::naming;

/// Immutable snapshot of one GitHub pull request, parsed from a single REST
/// response object. Identity is (owner, repo, number); superseded by
/// re-fetching, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub owner: String,
    pub repo: String,
    /// Head branch name (the branch a per-PR bot should build).
    pub branch: String,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub head_sha: String,
    pub state: PullRequestState,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestState {
    Open,
    Closed,
    Unrecognized(String),
}

impl PullRequestState {
    pub fn is_open(&self) -> bool { matches!(self, Self::Open) }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<&str> for PullRequestState {
    fn from(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "closed" => Self::Closed,
            _ => Self::Unrecognized(s.to_string()),
        }
    }
}

impl fmt::Display for PullRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Local snapshot of a bot configured on the CI server. Identity is
/// (server, id). Refreshed in full every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bot {
    pub id: String,
    pub tiny_id: Option<String>,
    pub name: String,
    pub server: String,
    pub source_repo_url: Option<String>,
    /// Workspace blueprint location identifier, needed to retarget the
    /// duplicated bot at a different branch.
    pub blueprint_id: Option<String>,
    /// Branch the bot currently builds, extracted from its blueprint.
    pub branch: Option<String>,
    /// Number of integrations ever started; used to tie-break duplicate
    /// bots matching the same PR.
    pub integration_counter: u64,
    /// Name of the template this bot was duplicated from, when known
    /// (populated for bots created during this process's lifetime).
    pub template_bot_name: Option<String>,
}

impl Bot {
    /// The PR number embedded in the bot's name, or `None` when the bot does
    /// not follow this engine's naming convention.
    pub fn pull_request_number(&self) -> Option<u64> {
        naming::pr_number_from_bot_name(&self.name)
    }
}

/// One observation of a bot's current or most recent integration. Produced
/// fresh on every poll; never persisted beyond the current pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BotStatus {
    pub bot_id: String,
    pub bot_name: String,
    pub server: String,
    pub integration_id: Option<String>,
    pub integration_number: Option<u64>,
    pub step: IntegrationStep,
    pub result: IntegrationResult,
    pub error_count: Option<u64>,
    pub warning_count: Option<u64>,
    pub analyzer_warning_count: Option<u64>,
    pub test_count: Option<u64>,
    pub test_failure_count: Option<u64>,
    pub code_coverage_percentage: Option<f64>,
    pub queued_at: Option<UtcDateTime>,
    pub started_at: Option<UtcDateTime>,
    pub ended_at: Option<UtcDateTime>,
}

impl BotStatus {
    /// A status for a bot that has never run an integration.
    pub fn never_integrated(bot: &Bot) -> Self {
        Self {
            bot_id: bot.id.clone(),
            bot_name: bot.name.clone(),
            server: bot.server.clone(),
            integration_id: None,
            integration_number: None,
            step: IntegrationStep::Pending,
            result: IntegrationResult::Unknown,
            error_count: None,
            warning_count: None,
            analyzer_warning_count: None,
            test_count: None,
            test_failure_count: None,
            code_coverage_percentage: None,
            queued_at: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    /// Web URL of the integration's logs on the CI server, used as the
    /// commit status details link.
    pub fn log_url(&self) -> Option<String> {
        let id = self.integration_id.as_ref()?;
        Some(format!("https://{}:20343/xcode/internal/api/integration/{id}/assets", self.server))
    }
}

/// The lifecycle step of an integration as reported by the CI server.
/// The server may introduce new values; those land in `Unrecognized` and
/// are treated as in-progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStep {
    Pending,
    Preparing,
    Checkout,
    BeforeTriggers,
    Building,
    Testing,
    Archiving,
    Processing,
    AfterTriggers,
    Uploading,
    Completed,
    Unrecognized(String),
}

impl IntegrationStep {
    pub const KNOWN_VALUES: &'static [&'static str] = &[
        "pending",
        "preparing",
        "checkout",
        "before-triggers",
        "building",
        "testing",
        "archiving",
        "processing",
        "after-triggers",
        "uploading",
        "completed",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Checkout => "checkout",
            Self::BeforeTriggers => "before-triggers",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::Archiving => "archiving",
            Self::Processing => "processing",
            Self::AfterTriggers => "after-triggers",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<&str> for IntegrationStep {
    fn from(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "preparing" => Self::Preparing,
            "checkout" => Self::Checkout,
            "before-triggers" => Self::BeforeTriggers,
            "building" => Self::Building,
            "testing" => Self::Testing,
            "archiving" => Self::Archiving,
            "processing" => Self::Processing,
            "after-triggers" => Self::AfterTriggers,
            "uploading" => Self::Uploading,
            "completed" => Self::Completed,
            _ => Self::Unrecognized(s.to_string()),
        }
    }
}

impl fmt::Display for IntegrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// The outcome of a completed integration as reported by the CI server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationResult {
    Unknown,
    Succeeded,
    BuildErrors,
    TestFailures,
    Warnings,
    AnalyzerWarnings,
    BuildFailed,
    CheckoutError,
    InternalError,
    InternalCheckoutError,
    InternalBuildError,
    InternalProcessingError,
    Canceled,
    TriggerError,
    Unrecognized(String),
}

impl IntegrationResult {
    pub const KNOWN_VALUES: &'static [&'static str] = &[
        "unknown",
        "succeeded",
        "build-errors",
        "test-failures",
        "warnings",
        "analyzer-warnings",
        "build-failed",
        "checkout-error",
        "internal-error",
        "internal-checkout-error",
        "internal-build-error",
        "internal-processing-error",
        "canceled",
        "trigger-error",
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "unknown",
            Self::Succeeded => "succeeded",
            Self::BuildErrors => "build-errors",
            Self::TestFailures => "test-failures",
            Self::Warnings => "warnings",
            Self::AnalyzerWarnings => "analyzer-warnings",
            Self::BuildFailed => "build-failed",
            Self::CheckoutError => "checkout-error",
            Self::InternalError => "internal-error",
            Self::InternalCheckoutError => "internal-checkout-error",
            Self::InternalBuildError => "internal-build-error",
            Self::InternalProcessingError => "internal-processing-error",
            Self::Canceled => "canceled",
            Self::TriggerError => "trigger-error",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<&str> for IntegrationResult {
    fn from(s: &str) -> Self {
        match s {
            "unknown" => Self::Unknown,
            "succeeded" => Self::Succeeded,
            "build-errors" => Self::BuildErrors,
            "test-failures" => Self::TestFailures,
            "warnings" => Self::Warnings,
            "analyzer-warnings" => Self::AnalyzerWarnings,
            "build-failed" => Self::BuildFailed,
            "checkout-error" => Self::CheckoutError,
            "internal-error" => Self::InternalError,
            "internal-checkout-error" => Self::InternalCheckoutError,
            "internal-build-error" => Self::InternalBuildError,
            "internal-processing-error" => Self::InternalProcessingError,
            "canceled" => Self::Canceled,
            "trigger-error" => Self::TriggerError,
            _ => Self::Unrecognized(s.to_string()),
        }
    }
}

impl fmt::Display for IntegrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A commit status value accepted by the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub const fn variants() -> &'static [Self] {
        &[Self::Pending, Self::Success, Self::Failure, Self::Error]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

impl FromStr for CommitState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
