use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use diesel::SqliteConnection;

use crate::{
    checkpoint::{Checkpoint, CheckpointRepo, RepoResult, SqliteRepo},
    db::{connection::connect_sqlite, migrate},
    job::{JobState, SeriesKey},
    spec::ProviderId,
};

/// Async handle over one SQLite connection.
///
/// Every call runs on the blocking pool; the connection is shared behind a
/// mutex so concurrent jobs serialize their (short) checkpoint writes.
#[derive(Clone)]
pub struct CheckpointStore {
    conn: Arc<Mutex<SqliteConnection>>,
    repo: SqliteRepo,
}

impl CheckpointStore {
    /// Migrate and open the database file at `path`, creating it if needed.
    pub fn open(path: &Path) -> RepoResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let url = path
            .to_str()
            .ok_or_else(|| anyhow!("checkpoint path is not UTF-8: {}", path.display()))?;
        migrate::run_sqlite(url)?;
        let conn = connect_sqlite(url)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            repo: SqliteRepo::new(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> RepoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteRepo, &mut SqliteConnection) -> RepoResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let repo = self.repo;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow!("checkpoint connection poisoned"))?;
            f(&repo, &mut conn)
        })
        .await
        .context("checkpoint task panicked")?
    }

    /// Every checkpoint keyed by series.
    pub async fn load_all(&self) -> RepoResult<HashMap<SeriesKey, Checkpoint>> {
        let rows = self.with_conn(|repo, conn| repo.load_all(conn)).await?;
        Ok(rows.into_iter().map(|c| (c.key.clone(), c)).collect())
    }

    /// Checkpoint of one series.
    pub async fn load(&self, key: &SeriesKey) -> RepoResult<Option<Checkpoint>> {
        let key = key.clone();
        self.with_conn(move |repo, conn| repo.load(conn, &key)).await
    }

    /// See [`CheckpointRepo::advance`].
    pub async fn advance(
        &self,
        key: &SeriesKey,
        provider: ProviderId,
        committed: DateTime<Utc>,
    ) -> RepoResult<DateTime<Utc>> {
        let key = key.clone();
        self.with_conn(move |repo, conn| repo.advance(conn, &key, provider, committed))
            .await
    }

    /// See [`CheckpointRepo::record_state`].
    pub async fn record_state(
        &self,
        key: &SeriesKey,
        provider: ProviderId,
        state: JobState,
        last_error: Option<String>,
    ) -> RepoResult<()> {
        let key = key.clone();
        self.with_conn(move |repo, conn| {
            repo.record_state(conn, &key, provider, state, last_error.as_deref())
        })
        .await
    }
}
