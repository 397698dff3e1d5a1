use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{Semaphore, watch},
    task::JoinSet,
    time::sleep,
};
use xcbot_core::{
    BotDirectory, PullSource, StatusSink,
    config::SyncConfig,
    error::SyncError,
    models::{Bot, BotStatus, IntegrationStep, PullRequest},
    naming,
    status::{detail_comment, translate},
};
use xcbot_store::{StatusKey, StatusStore};

/// The convergence actions computed for one pass: which PRs need a bot,
/// which (PR, bot) pairs proceed to status sync, and which bots go away.
#[derive(Debug, Default)]
pub struct Plan {
    pub create: Vec<PullRequest>,
    pub keep: Vec<(PullRequest, Bot)>,
    pub delete: Vec<Bot>,
}

/// Diff the desired bot set (one per open PR) against the actual bot
/// directory. Bots that do not follow the naming convention are ignored,
/// as is the template bot itself. When several bots match the same PR
/// number, the one with the highest integration counter wins and the rest
/// are marked for deletion.
pub fn plan(pulls: &[PullRequest], bots: Vec<Bot>, template_bot: &str) -> Plan {
    let mut by_number: HashMap<u64, Vec<Bot>> = HashMap::new();
    for bot in bots {
        if bot.name == template_bot {
            continue;
        }
        match bot.pull_request_number() {
            Some(number) => by_number.entry(number).or_default().push(bot),
            None => {
                tracing::debug!(bot = %bot.name, "Ignoring bot outside the naming convention");
            }
        }
    }

    let mut result = Plan::default();
    for candidates in by_number.values_mut() {
        candidates.sort_by(|a, b| {
            (b.integration_counter, &b.id).cmp(&(a.integration_counter, &a.id))
        });
        // Stale duplicates beyond the first.
        result.delete.extend(candidates.drain(1..));
    }

    for pr in pulls {
        if !pr.state.is_open() {
            continue;
        }
        match by_number.remove(&pr.number).and_then(|mut v| v.pop()) {
            Some(bot) => result.keep.push((pr.clone(), bot)),
            None => result.create.push(pr.clone()),
        }
    }

    // Whatever remains matches no open PR.
    result.delete.extend(by_number.into_values().flatten());
    result
}

/// What one pass did (or, in dry-run mode, would have done). Per-item
/// errors are aggregated here; pass-fatal errors come back as `Err` from
/// `run_pass` instead.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub statuses_reported: usize,
    pub comments_posted: usize,
    pub errors: Vec<SyncError>,
}

impl PassOutcome {
    pub fn has_errors(&self) -> bool { !self.errors.is_empty() }

    pub fn log(&self) {
        tracing::info!(
            created = self.created.len(),
            deleted = self.deleted.len(),
            statuses = self.statuses_reported,
            comments = self.comments_posted,
            errors = self.errors.len(),
            "Pass complete"
        );
    }
}

enum ItemReport {
    Created(String),
    Deleted(String),
    StatusReported { commented: bool },
    Unchanged,
    Failed(SyncError),
}

/// Shared context for the per-item workers of one pass.
struct PassContext {
    directory: Arc<dyn BotDirectory>,
    sink: Arc<dyn StatusSink>,
    store: StatusStore,
    dry_run: bool,
}

/// The reconciliation engine: converges the CI server's bot set towards
/// one bot per open PR and propagates build results back as commit
/// statuses, deduplicated through the status store.
pub struct Reconciler {
    config: SyncConfig,
    owner: String,
    repo: String,
    pulls: Arc<dyn PullSource>,
    directory: Arc<dyn BotDirectory>,
    sink: Arc<dyn StatusSink>,
    store: StatusStore,
}

impl Reconciler {
    pub fn new(
        config: SyncConfig,
        owner: impl Into<String>,
        repo: impl Into<String>,
        pulls: Arc<dyn PullSource>,
        directory: Arc<dyn BotDirectory>,
        sink: Arc<dyn StatusSink>,
        store: StatusStore,
    ) -> Self {
        Self {
            config,
            owner: owner.into(),
            repo: repo.into(),
            pulls,
            directory,
            sink,
            store,
        }
    }

    /// One full fetch–diff–act–report cycle. Ground truth is re-read from
    /// both systems at the start, so a partially-failed previous pass is
    /// corrected here rather than compounding.
    pub async fn run_pass(&self) -> Result<PassOutcome, SyncError> {
        let pulls =
            self.pulls.open_pull_requests(&self.owner, &self.repo).await.map_err(|source| {
                SyncError::SourceFetch {
                    owner: self.owner.clone(),
                    repo: self.repo.clone(),
                    source,
                }
            })?;
        let bots = self.directory.bots().await.map_err(|source| SyncError::DirectoryFetch {
            server: self.directory.server_name().to_string(),
            source,
        })?;
        let template = bots
            .iter()
            .find(|bot| bot.name == self.config.template_bot)
            .cloned()
            .ok_or_else(|| SyncError::TemplateMissing {
                server: self.directory.server_name().to_string(),
                name: self.config.template_bot.clone(),
            })?;

        let plan = plan(&pulls, bots, &self.config.template_bot);
        tracing::info!(
            open_prs = pulls.len(),
            create = plan.create.len(),
            keep = plan.keep.len(),
            delete = plan.delete.len(),
            dry_run = self.config.dry_run,
            "Computed convergence plan"
        );

        let ctx = Arc::new(PassContext {
            directory: self.directory.clone(),
            sink: self.sink.clone(),
            store: self.store.clone(),
            dry_run: self.config.dry_run,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<ItemReport> = JoinSet::new();

        for pr in plan.create {
            let ctx = ctx.clone();
            let template = template.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("Semaphore closed");
                create_bot(&ctx, &template, &pr).await
            });
        }
        for (pr, bot) in plan.keep {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("Semaphore closed");
                sync_status(&ctx, &pr, &bot).await
            });
        }
        for bot in plan.delete {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let key = bot.branch.as_ref().map(|branch| {
                StatusKey::new(self.owner.clone(), self.repo.clone(), branch.clone())
            });
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("Semaphore closed");
                delete_bot(&ctx, &bot, key).await
            });
        }

        let mut outcome = PassOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemReport::Created(name)) => outcome.created.push(name),
                Ok(ItemReport::Deleted(name)) => outcome.deleted.push(name),
                Ok(ItemReport::StatusReported { commented }) => {
                    outcome.statuses_reported += 1;
                    if commented {
                        outcome.comments_posted += 1;
                    }
                }
                Ok(ItemReport::Unchanged) => {}
                Ok(ItemReport::Failed(err)) => {
                    tracing::error!("{err:?}");
                    outcome.errors.push(err);
                }
                Err(err) => tracing::error!("Worker task failed: {err}"),
            }
        }
        Ok(outcome)
    }

    /// Run passes forever, `interval_secs` apart, until `shutdown` flips to
    /// true. The inter-pass wait is a single cancellable sleep; a shutdown
    /// request interrupts it promptly without starting another pass.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            match self.run_pass().await {
                Ok(outcome) => outcome.log(),
                // Pass-fatal; the next pass re-reads ground truth.
                Err(err) => tracing::error!("Reconciliation pass failed: {err:?}"),
            }
            if *shutdown.borrow() {
                return;
            }
            select! {
                _ = sleep(interval) => {}
                // A closed channel also means shutdown; non-true updates
                // leave the sleep running.
                _ = shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("Shutdown requested, stopping");
                    return;
                }
            }
        }
    }
}

/// Duplicate the template for a PR, start its first integration, and
/// report the initial pending status.
async fn create_bot(ctx: &PassContext, template: &Bot, pr: &PullRequest) -> ItemReport {
    let name = naming::bot_name_for_pr(pr.number, &pr.title);
    if ctx.dry_run {
        tracing::info!(
            "dry-run: would create bot {name} for PR #{} on branch {}",
            pr.number,
            pr.branch
        );
        return ItemReport::Created(name);
    }
    let bot = match ctx.directory.duplicate_bot(template, &name, &pr.branch).await {
        Ok(bot) => bot,
        Err(source) => {
            return ItemReport::Failed(SyncError::BotCreate { number: pr.number, name, source });
        }
    };
    if let Err(source) = ctx.directory.start_integration(&bot).await {
        return ItemReport::Failed(SyncError::BotCreate { number: pr.number, name, source });
    }
    tracing::info!(bot = %bot.name, pr = pr.number, branch = %pr.branch, "Created bot");
    // The first integration is queued; report pending without re-polling.
    match report_status(ctx, pr, &BotStatus::never_integrated(&bot)).await {
        ItemReport::Failed(err) => ItemReport::Failed(err),
        _ => ItemReport::Created(name),
    }
}

/// Poll the bot's latest integration and propagate it to the PR.
async fn sync_status(ctx: &PassContext, pr: &PullRequest, bot: &Bot) -> ItemReport {
    let status = match ctx.directory.status(bot).await {
        Ok(status) => status,
        Err(source) => {
            return ItemReport::Failed(SyncError::StatusPoll { name: bot.name.clone(), source });
        }
    };
    report_status(ctx, pr, &status).await
}

/// Write the translated commit status back to the hosting service, unless
/// the store shows the same (status, SHA) pair was already reported. A
/// completed integration additionally gets a detail comment on the PR,
/// riding the same dedup record.
async fn report_status(ctx: &PassContext, pr: &PullRequest, status: &BotStatus) -> ItemReport {
    let commit = translate(status);
    let key = StatusKey::new(pr.owner.clone(), pr.repo.clone(), pr.branch.clone());
    let stored = match ctx.store.get(&key).await {
        Ok(stored) => stored,
        Err(err) => return ItemReport::Failed(SyncError::Store(err)),
    };
    let unchanged = stored
        .as_ref()
        .is_some_and(|record| record.state == commit.state && record.sha == pr.head_sha);
    if unchanged {
        return ItemReport::Unchanged;
    }
    if ctx.dry_run {
        tracing::info!(
            "dry-run: would report {} for PR #{} at {}: {}",
            commit.state,
            pr.number,
            pr.head_sha,
            commit.description
        );
        return ItemReport::StatusReported { commented: false };
    }
    if let Err(source) = ctx
        .sink
        .set_status(pr, commit.state, &commit.description, status.log_url().as_deref())
        .await
    {
        return ItemReport::Failed(SyncError::StatusWrite {
            number: pr.number,
            sha: pr.head_sha.clone(),
            source,
        });
    }
    if let Err(err) = ctx.store.put(&key, commit.state, &pr.head_sha).await {
        return ItemReport::Failed(SyncError::Store(err));
    }
    tracing::info!(
        pr = pr.number,
        sha = %pr.head_sha,
        state = %commit.state,
        "Reported commit status"
    );
    let mut commented = false;
    if status.step == IntegrationStep::Completed {
        // Best-effort: the status is already reported and recorded, so a
        // lost comment is logged, not retried.
        match ctx.sink.add_comment(pr, &detail_comment(status)).await {
            Ok(()) => commented = true,
            Err(err) => {
                tracing::warn!(pr = pr.number, "Failed to post completion comment: {err:#}");
            }
        }
    }
    ItemReport::StatusReported { commented }
}

/// Remove a bot whose PR is gone (or that lost a duplicate tie-break),
/// along with its reported-status record.
async fn delete_bot(ctx: &PassContext, bot: &Bot, key: Option<StatusKey>) -> ItemReport {
    if ctx.dry_run {
        tracing::info!("dry-run: would delete bot {}", bot.name);
        return ItemReport::Deleted(bot.name.clone());
    }
    if let Err(source) = ctx.directory.delete_bot(bot).await {
        return ItemReport::Failed(SyncError::BotDelete {
            name: bot.name.clone(),
            server: bot.server.clone(),
            source,
        });
    }
    tracing::info!(bot = %bot.name, "Deleted bot");
    if let Some(key) = key {
        if let Err(err) = ctx.store.delete(&key).await {
            tracing::warn!("Failed to clear status record for {}: {err:#}", bot.name);
        }
    }
    ItemReport::Deleted(bot.name.clone())
}

#[cfg(test)]
mod tests;
