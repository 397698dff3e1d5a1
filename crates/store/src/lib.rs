use anyhow::{Context, Result};
use sqlx::{
    Row, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use time::{Duration, UtcDateTime};
use xcbot_core::{config::StoreConfig, models::CommitState};

/// Key of one reported-status record: the tracked repository plus the PR's
/// head branch.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct StatusKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl StatusKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self { owner: owner.into(), repo: repo.into(), branch: branch.into() }
    }
}

/// The last commit status successfully reported for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedStatus {
    pub state: CommitState,
    pub sha: String,
    pub updated_at: UtcDateTime,
}

/// Persistent record of which (status, SHA) pair was last reported to the
/// hosting service per key. The reconciler writes a commit status only when
/// the observed pair differs from the stored one, which turns the stateless
/// per-pass polling into at-most-once reporting per observed state.
#[derive(Clone)]
pub struct StatusStore {
    pub pool: SqlitePool,
    expiration: Duration,
}

impl StatusStore {
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        // An in-memory SQLite database exists per connection, so the pool
        // must not open a second one.
        let pool = if config.url.contains(":memory:") || config.url.contains("mode=memory") {
            SqlitePoolOptions::new().max_connections(1).connect(&config.url).await
        } else {
            if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
                tracing::info!(url = %config.url, "Creating status store database");
                Sqlite::create_database(&config.url)
                    .await
                    .context("Failed to create database")?;
            }
            SqlitePool::connect(&config.url).await
        }
        .context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool, expiration: Duration::days(config.expiration_days as i64) })
    }

    /// The last reported status for `key`, or `None` if no record exists or
    /// the record has expired. Expired rows are left in place (lazy expiry);
    /// `cleanup_expired` removes them in bulk.
    pub async fn get(&self, key: &StatusKey) -> Result<Option<ReportedStatus>> {
        let row = sqlx::query(
            "SELECT status, sha, updated_at FROM reported_statuses \
             WHERE owner = ? AND repo = ? AND branch = ?",
        )
        .bind(&key.owner)
        .bind(&key.repo)
        .bind(&key.branch)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let updated_at = UtcDateTime::from_unix_timestamp(row.get::<i64, _>("updated_at"))
            .context("Invalid timestamp in status store")?;
        if UtcDateTime::now() - updated_at > self.expiration {
            return Ok(None);
        }
        let status: String = row.get("status");
        let Ok(state) = status.parse::<CommitState>() else {
            // A row written by a newer version; report as absent so the
            // status is re-derived and overwritten.
            tracing::warn!(%status, "Unrecognized status value in store");
            return Ok(None);
        };
        Ok(Some(ReportedStatus { state, sha: row.get("sha"), updated_at }))
    }

    /// Record that (state, sha) was successfully reported for `key`.
    pub async fn put(&self, key: &StatusKey, state: CommitState, sha: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO reported_statuses (owner, repo, branch, status, sha, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (owner, repo, branch) DO UPDATE \
             SET status = EXCLUDED.status, sha = EXCLUDED.sha, updated_at = EXCLUDED.updated_at",
        )
        .bind(&key.owner)
        .bind(&key.repo)
        .bind(&key.branch)
        .bind(state.as_str())
        .bind(sha)
        .bind(UtcDateTime::now().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &StatusKey) -> Result<()> {
        sqlx::query("DELETE FROM reported_statuses WHERE owner = ? AND repo = ? AND branch = ?")
            .bind(&key.owner)
            .bind(&key.repo)
            .bind(&key.branch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM reported_statuses").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete rows past the expiration. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let cutoff = (UtcDateTime::now() - self.expiration).unix_timestamp();
        let result = sqlx::query("DELETE FROM reported_statuses WHERE updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) { self.pool.close().await }
}

#[cfg(test)]
mod tests {
    use xcbot_core::config::StoreConfig;

    use super::*;

    async fn memory_store() -> StatusStore {
        let config =
            StoreConfig { url: "sqlite::memory:".to_string(), expiration_days: 30 };
        StatusStore::new(&config).await.unwrap()
    }

    /// Rewind a record's timestamp, simulating an old entry.
    async fn age_record(store: &StatusStore, key: &StatusKey, days: i64) {
        let updated_at = (UtcDateTime::now() - Duration::days(days)).unix_timestamp();
        sqlx::query(
            "UPDATE reported_statuses SET updated_at = ? \
             WHERE owner = ? AND repo = ? AND branch = ?",
        )
        .bind(updated_at)
        .bind(&key.owner)
        .bind(&key.repo)
        .bind(&key.branch)
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = memory_store().await;
        let key = StatusKey::new("acme", "widget", "fix/login");
        assert_eq!(store.get(&key).await.unwrap(), None);

        store.put(&key, CommitState::Pending, "abc123").await.unwrap();
        let reported = store.get(&key).await.unwrap().unwrap();
        assert_eq!(reported.state, CommitState::Pending);
        assert_eq!(reported.sha, "abc123");

        // Distinct report overwrites the record.
        store.put(&key, CommitState::Failure, "abc123").await.unwrap();
        let reported = store.get(&key).await.unwrap().unwrap();
        assert_eq!(reported.state, CommitState::Failure);

        // A different branch is a different key.
        let other = StatusKey::new("acme", "widget", "main");
        assert_eq!(store.get(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let store = memory_store().await;
        let key = StatusKey::new("acme", "widget", "fix/login");
        store.put(&key, CommitState::Success, "abc123").await.unwrap();
        age_record(&store, &key, 31).await;

        // Expired entries behave as absent without being removed.
        assert_eq!(store.get(&key).await.unwrap(), None);
        let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reported_statuses")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row_count, 1);

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reported_statuses")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row_count, 0);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let store = memory_store().await;
        let a = StatusKey::new("acme", "widget", "a");
        let b = StatusKey::new("acme", "widget", "b");
        store.put(&a, CommitState::Success, "s1").await.unwrap();
        store.put(&b, CommitState::Failure, "s2").await.unwrap();

        store.delete(&a).await.unwrap();
        assert_eq!(store.get(&a).await.unwrap(), None);
        assert!(store.get(&b).await.unwrap().is_some());

        store.clear().await.unwrap();
        assert_eq!(store.get(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recent_record_survives() {
        let store = memory_store().await;
        let key = StatusKey::new("acme", "widget", "fix/login");
        store.put(&key, CommitState::Success, "abc123").await.unwrap();
        age_record(&store, &key, 29).await;
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
    }
}
