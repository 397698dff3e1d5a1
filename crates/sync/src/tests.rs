use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::watch;
use xcbot_core::{
    BotDirectory, PullSource, StatusSink,
    config::{StoreConfig, SyncConfig},
    error::SyncError,
    models::{
        Bot, BotStatus, CommitState, IntegrationResult, IntegrationStep, PullRequest,
        PullRequestState,
    },
};
use xcbot_store::{StatusKey, StatusStore};

use super::{Reconciler, plan};

const SERVER: &str = "ci.test";
const TEMPLATE: &str = "template-bot";

fn pr(number: u64, title: &str, branch: &str, sha: &str) -> PullRequest {
    PullRequest {
        owner: "acme".to_string(),
        repo: "widget".to_string(),
        branch: branch.to_string(),
        number,
        title: title.to_string(),
        body: None,
        head_sha: sha.to_string(),
        state: PullRequestState::Open,
        html_url: None,
    }
}

fn bot(id: &str, name: &str, branch: &str, integration_counter: u64) -> Bot {
    Bot {
        id: id.to_string(),
        tiny_id: None,
        name: name.to_string(),
        server: SERVER.to_string(),
        source_repo_url: Some("https://github.com/acme/widget.git".to_string()),
        blueprint_id: Some("BP-1".to_string()),
        branch: Some(branch.to_string()),
        integration_counter,
        template_bot_name: None,
    }
}

fn template() -> Bot { bot("b-template", TEMPLATE, "main", 100) }

fn completed(bot: &Bot, result: &str) -> BotStatus {
    BotStatus {
        step: IntegrationStep::Completed,
        result: IntegrationResult::from(result),
        integration_id: Some(format!("i-{}", bot.id)),
        integration_number: Some(bot.integration_counter),
        ..BotStatus::never_integrated(bot)
    }
}

#[derive(Default)]
struct MockPulls {
    pulls: Mutex<Vec<PullRequest>>,
    calls: AtomicU32,
    fail: bool,
}

#[async_trait]
impl PullSource for MockPulls {
    async fn open_pull_requests(&self, _owner: &str, _repo: &str) -> Result<Vec<PullRequest>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("github is down");
        }
        Ok(self.pulls.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MockDirectory {
    bots: Mutex<Vec<Bot>>,
    statuses: Mutex<HashMap<String, BotStatus>>,
    created: Mutex<Vec<(String, String)>>,
    started: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    fail_duplicate_of: Mutex<HashSet<String>>,
    fail_list: bool,
}

impl MockDirectory {
    fn with_bots(bots: Vec<Bot>) -> Self {
        Self { bots: Mutex::new(bots), ..Self::default() }
    }

    fn set_status(&self, bot_id: &str, status: BotStatus) {
        self.statuses.lock().unwrap().insert(bot_id.to_string(), status);
    }
}

#[async_trait]
impl BotDirectory for MockDirectory {
    fn server_name(&self) -> &str { SERVER }

    async fn bots(&self) -> Result<Vec<Bot>> {
        if self.fail_list {
            bail!("server unreachable");
        }
        Ok(self.bots.lock().unwrap().clone())
    }

    async fn duplicate_bot(&self, template: &Bot, name: &str, branch: &str) -> Result<Bot> {
        if self.fail_duplicate_of.lock().unwrap().contains(name) {
            bail!("duplicate rejected");
        }
        let mut new_bot = bot(&format!("b-{name}"), name, branch, 0);
        new_bot.template_bot_name = Some(template.name.clone());
        self.created.lock().unwrap().push((name.to_string(), branch.to_string()));
        self.bots.lock().unwrap().push(new_bot.clone());
        Ok(new_bot)
    }

    async fn start_integration(&self, bot: &Bot) -> Result<()> {
        self.started.lock().unwrap().push(bot.name.clone());
        Ok(())
    }

    async fn status(&self, bot: &Bot) -> Result<BotStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&bot.id)
            .cloned()
            .unwrap_or_else(|| BotStatus::never_integrated(bot)))
    }

    async fn delete_bot(&self, bot: &Bot) -> Result<()> {
        self.deleted.lock().unwrap().push(bot.name.clone());
        self.bots.lock().unwrap().retain(|b| b.id != bot.id);
        Ok(())
    }
}

#[derive(Default)]
struct MockSink {
    statuses: Mutex<Vec<(u64, CommitState, String, String)>>,
    comments: Mutex<Vec<(u64, String)>>,
    fail: bool,
    fail_comments: bool,
}

#[async_trait]
impl StatusSink for MockSink {
    async fn set_status(
        &self,
        pr: &PullRequest,
        state: CommitState,
        description: &str,
        _target_url: Option<&str>,
    ) -> Result<()> {
        if self.fail {
            bail!("status write rejected");
        }
        self.statuses.lock().unwrap().push((
            pr.number,
            state,
            pr.head_sha.clone(),
            description.to_string(),
        ));
        Ok(())
    }

    async fn add_comment(&self, pr: &PullRequest, body: &str) -> Result<()> {
        if self.fail || self.fail_comments {
            bail!("comment rejected");
        }
        self.comments.lock().unwrap().push((pr.number, body.to_string()));
        Ok(())
    }
}

struct Harness {
    pulls: Arc<MockPulls>,
    directory: Arc<MockDirectory>,
    sink: Arc<MockSink>,
    store: StatusStore,
    reconciler: Reconciler,
}

async fn harness(pulls: Vec<PullRequest>, bots: Vec<Bot>) -> Harness {
    harness_with(pulls, bots, false).await
}

async fn harness_with(pulls: Vec<PullRequest>, bots: Vec<Bot>, dry_run: bool) -> Harness {
    let pulls = Arc::new(MockPulls { pulls: Mutex::new(pulls), calls: AtomicU32::new(0), fail: false });
    let directory = Arc::new(MockDirectory::with_bots(bots));
    let sink = Arc::new(MockSink::default());
    let store = StatusStore::new(&StoreConfig {
        url: "sqlite::memory:".to_string(),
        expiration_days: 30,
    })
    .await
    .unwrap();
    let config = SyncConfig {
        template_bot: TEMPLATE.to_string(),
        dry_run,
        interval_secs: 1,
        concurrency: 2,
    };
    let reconciler = Reconciler::new(
        config,
        "acme",
        "widget",
        pulls.clone(),
        directory.clone(),
        sink.clone(),
        store.clone(),
    );
    Harness { pulls, directory, sink, store, reconciler }
}

#[test]
fn test_plan_diff() {
    let pulls = vec![
        pr(42, "Fix login bug", "fix/login", "abc123"),
        pr(7, "Add dark mode", "feature/dark", "def456"),
    ];
    let bots = vec![
        template(),
        bot("b-7", "pr-7-add-dark-mode", "feature/dark", 3),
        bot("b-9", "pr-9-stale", "feature/old", 2),
        bot("b-n", "nightly", "main", 50),
    ];
    let plan = plan(&pulls, bots, TEMPLATE);

    assert_eq!(plan.create.iter().map(|p| p.number).collect::<Vec<_>>(), vec![42]);
    assert_eq!(plan.keep.len(), 1);
    assert_eq!(plan.keep[0].0.number, 7);
    assert_eq!(plan.keep[0].1.id, "b-7");
    // The unrelated "nightly" bot and the template are untouched.
    assert_eq!(plan.delete.iter().map(|b| b.name.as_str()).collect::<Vec<_>>(), vec![
        "pr-9-stale"
    ]);
}

#[test]
fn test_plan_duplicate_tie_break() {
    // Scenario D: two bots match PR #3; the higher integration counter wins.
    let pulls = vec![pr(3, "Refactor", "refactor", "aaa")];
    let bots = vec![
        template(),
        bot("b-3a", "pr-3-refactor", "refactor", 5),
        bot("b-3b", "pr-3-refactor-old", "refactor", 9),
    ];
    let plan = plan(&pulls, bots, TEMPLATE);
    assert!(plan.create.is_empty());
    assert_eq!(plan.keep[0].1.id, "b-3b");
    assert_eq!(plan.delete.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(), vec!["b-3a"]);
}

#[tokio::test]
async fn test_scenario_a_create_and_pending_status() {
    let h = harness(vec![pr(42, "Fix login bug", "fix/login", "abc123")], vec![template()]).await;
    let outcome = h.reconciler.run_pass().await.unwrap();

    assert_eq!(outcome.created, vec!["pr-42-fix-login-bug"]);
    assert!(outcome.errors.is_empty());
    assert_eq!(
        h.directory.created.lock().unwrap().as_slice(),
        &[("pr-42-fix-login-bug".to_string(), "fix/login".to_string())]
    );
    assert_eq!(h.directory.started.lock().unwrap().as_slice(), &["pr-42-fix-login-bug"]);

    // The new bot's first status is pending, reported once.
    let statuses = h.sink.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!((statuses[0].0, statuses[0].1), (42, CommitState::Pending));
    assert!(h.sink.comments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_idempotent_second_pass() {
    let h = harness(vec![pr(42, "Fix login bug", "fix/login", "abc123")], vec![template()]).await;
    h.reconciler.run_pass().await.unwrap();
    let outcome = h.reconciler.run_pass().await.unwrap();

    // No remote state changed between passes: zero new side effects.
    assert!(outcome.created.is_empty());
    assert!(outcome.deleted.is_empty());
    assert_eq!(outcome.statuses_reported, 0);
    assert_eq!(h.directory.created.lock().unwrap().len(), 1);
    assert_eq!(h.sink.statuses.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_scenario_b_failure_reported_exactly_once() {
    let existing = bot("b-42", "pr-42-fix-login-bug", "fix/login", 2);
    let h = harness(
        vec![pr(42, "Fix login bug", "fix/login", "abc123")],
        vec![template(), existing.clone()],
    )
    .await;
    h.directory.set_status("b-42", completed(&existing, "build-errors"));

    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.statuses_reported, 1);
    assert_eq!(outcome.comments_posted, 1);
    {
        let statuses = h.sink.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        let (number, state, sha, _) = &statuses[0];
        assert_eq!((*number, *state, sha.as_str()), (42, CommitState::Failure, "abc123"));
    }

    // Same step/result/SHA observed again: no second write, no second comment.
    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.statuses_reported, 0);
    assert_eq!(h.sink.statuses.lock().unwrap().len(), 1);
    assert_eq!(h.sink.comments.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_new_sha_is_reported_again() {
    let existing = bot("b-42", "pr-42-fix-login-bug", "fix/login", 2);
    let h = harness(
        vec![pr(42, "Fix login bug", "fix/login", "abc123")],
        vec![template(), existing.clone()],
    )
    .await;
    h.directory.set_status("b-42", completed(&existing, "succeeded"));
    h.reconciler.run_pass().await.unwrap();

    // The PR got a new head commit; same success state must be re-reported.
    h.pulls.pulls.lock().unwrap()[0].head_sha = "def456".to_string();
    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.statuses_reported, 1);
    let statuses = h.sink.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[1].2, "def456");
}

#[tokio::test]
async fn test_scenario_c_closed_pr_deletes_bot() {
    let h = harness(vec![], vec![template(), bot("b-7", "pr-7-gone", "feature/gone", 4)]).await;
    // A record left over from when PR #7 was open.
    let key = StatusKey::new("acme", "widget", "feature/gone");
    h.store.put(&key, CommitState::Pending, "old-sha").await.unwrap();

    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.deleted, vec!["pr-7-gone"]);
    assert_eq!(h.directory.deleted.lock().unwrap().as_slice(), &["pr-7-gone"]);
    // No status call was made for the closed PR, and its record is gone.
    assert!(h.sink.statuses.lock().unwrap().is_empty());
    assert_eq!(h.store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_scenario_d_duplicate_bots_converge() {
    let keeper = bot("b-3b", "pr-3-refactor", "refactor", 9);
    let h = harness(
        vec![pr(3, "Refactor", "refactor", "aaa")],
        vec![template(), bot("b-3a", "pr-3-refactor", "refactor", 5), keeper.clone()],
    )
    .await;
    h.directory.set_status("b-3b", completed(&keeper, "succeeded"));

    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(h.directory.deleted.lock().unwrap().as_slice(), &["pr-3-refactor"]);
    assert_eq!(h.directory.bots().await.unwrap().len(), 2);
    assert_eq!(outcome.statuses_reported, 1);
    assert_eq!(h.sink.statuses.lock().unwrap()[0].1, CommitState::Success);
}

#[tokio::test]
async fn test_dry_run_suppresses_side_effects() {
    let stale = bot("b-9", "pr-9-stale", "feature/old", 2);
    let h = harness_with(
        vec![pr(42, "Fix login bug", "fix/login", "abc123")],
        vec![template(), stale],
        true,
    )
    .await;
    let outcome = h.reconciler.run_pass().await.unwrap();

    // The plan is computed and reported...
    assert_eq!(outcome.created, vec!["pr-42-fix-login-bug"]);
    assert_eq!(outcome.deleted, vec!["pr-9-stale"]);
    // ...but nothing was touched.
    assert!(h.directory.created.lock().unwrap().is_empty());
    assert!(h.directory.started.lock().unwrap().is_empty());
    assert!(h.directory.deleted.lock().unwrap().is_empty());
    assert!(h.sink.statuses.lock().unwrap().is_empty());
    assert_eq!(h.store.get(&StatusKey::new("acme", "widget", "fix/login")).await.unwrap(), None);
}

#[tokio::test]
async fn test_create_failure_does_not_abort_pass() {
    let h = harness(
        vec![pr(1, "One", "b1", "s1"), pr(2, "Two", "b2", "s2")],
        vec![template()],
    )
    .await;
    h.directory.fail_duplicate_of.lock().unwrap().insert("pr-1-one".to_string());

    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.created, vec!["pr-2-two"]);
    assert_eq!(outcome.errors.len(), 1);
    match &outcome.errors[0] {
        SyncError::BotCreate { number, name, .. } => {
            assert_eq!(*number, 1);
            assert_eq!(name, "pr-1-one");
            assert!(!outcome.errors[0].is_pass_fatal());
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_status_write_failure_leaves_store_untouched() {
    let existing = bot("b-42", "pr-42-fix-login-bug", "fix/login", 2);
    let h = harness(
        vec![pr(42, "Fix login bug", "fix/login", "abc123")],
        vec![template(), existing.clone()],
    )
    .await;
    h.directory.set_status("b-42", completed(&existing, "build-errors"));
    // Force the sink down for this pass.
    let sink = Arc::new(MockSink { fail: true, ..MockSink::default() });
    let reconciler = Reconciler::new(
        SyncConfig {
            template_bot: TEMPLATE.to_string(),
            dry_run: false,
            interval_secs: 1,
            concurrency: 2,
        },
        "acme",
        "widget",
        h.pulls.clone(),
        h.directory.clone(),
        sink,
        h.store.clone(),
    );

    let outcome = reconciler.run_pass().await.unwrap();
    assert!(matches!(outcome.errors[0], SyncError::StatusWrite { number: 42, .. }));
    // Nothing recorded, so the next (healthy) pass reports it.
    assert_eq!(h.store.get(&StatusKey::new("acme", "widget", "fix/login")).await.unwrap(), None);
    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.statuses_reported, 1);
}

#[tokio::test]
async fn test_comment_failure_is_logged_not_retried() {
    let existing = bot("b-42", "pr-42-fix-login-bug", "fix/login", 2);
    let h = harness(
        vec![pr(42, "Fix login bug", "fix/login", "abc123")],
        vec![template(), existing.clone()],
    )
    .await;
    h.directory.set_status("b-42", completed(&existing, "build-errors"));
    let sink = Arc::new(MockSink { fail_comments: true, ..MockSink::default() });
    let reconciler = Reconciler::new(
        SyncConfig {
            template_bot: TEMPLATE.to_string(),
            dry_run: false,
            interval_secs: 1,
            concurrency: 2,
        },
        "acme",
        "widget",
        h.pulls.clone(),
        h.directory.clone(),
        sink.clone(),
        h.store.clone(),
    );

    // The status write succeeded, so the item is not failed and the dedup
    // record is written despite the lost comment.
    let outcome = reconciler.run_pass().await.unwrap();
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.statuses_reported, 1);
    assert_eq!(outcome.comments_posted, 0);
    assert_eq!(sink.statuses.lock().unwrap().len(), 1);
    let record =
        h.store.get(&StatusKey::new("acme", "widget", "fix/login")).await.unwrap().unwrap();
    assert_eq!((record.state, record.sha.as_str()), (CommitState::Failure, "abc123"));

    // A later healthy pass sees the recorded pair and stays quiet.
    let outcome = h.reconciler.run_pass().await.unwrap();
    assert_eq!(outcome.statuses_reported, 0);
    assert!(h.sink.comments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_source_fetch_failure_is_pass_fatal() {
    let h = harness(vec![], vec![template()]).await;
    let pulls = Arc::new(MockPulls { fail: true, ..MockPulls::default() });
    let reconciler = Reconciler::new(
        SyncConfig {
            template_bot: TEMPLATE.to_string(),
            dry_run: false,
            interval_secs: 1,
            concurrency: 2,
        },
        "acme",
        "widget",
        pulls,
        h.directory.clone(),
        h.sink.clone(),
        h.store.clone(),
    );
    let err = reconciler.run_pass().await.unwrap_err();
    assert!(matches!(err, SyncError::SourceFetch { .. }));
    assert!(err.is_pass_fatal());
    // Nothing was attempted against the directory.
    assert!(h.directory.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_template_is_pass_fatal() {
    let h = harness(vec![pr(1, "One", "b1", "s1")], vec![bot("b-n", "nightly", "main", 1)]).await;
    let err = h.reconciler.run_pass().await.unwrap_err();
    assert!(matches!(err, SyncError::TemplateMissing { .. }));
    assert!(err.is_pass_fatal());
}

#[tokio::test]
async fn test_run_loop_honors_shutdown() {
    let h = harness(vec![], vec![template()]).await;
    let (tx, rx) = watch::channel(true);
    // Shutdown already requested: exactly one pass runs, then the loop ends.
    h.reconciler.run_loop(rx).await;
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_ignores_non_shutdown_watch_updates() {
    // The sqlite connect in the harness runs on a blocking thread; with the
    // clock paused it would auto-advance past the pool's acquire timeout.
    tokio::time::resume();
    let h = harness(vec![], vec![template()]).await;
    tokio::time::pause();
    let (tx, rx) = watch::channel(false);
    let pulls = h.pulls.clone();
    let reconciler = h.reconciler;
    let handle = tokio::spawn(async move { reconciler.run_loop(rx).await });

    // Let the first pass finish and the loop settle into its sleep.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pulls.calls.load(Ordering::SeqCst), 1);

    // A non-shutdown update must not cut the interval short.
    tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pulls.calls.load(Ordering::SeqCst), 1);

    tx.send(true).unwrap();
    handle.await.unwrap();
}
