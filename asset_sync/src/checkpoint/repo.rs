use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::{
    checkpoint::{Checkpoint, CheckpointRepo, RepoResult},
    job::{JobState, SeriesKey},
    schema::ingest_checkpoint::{self, dsl as ic},
    spec::ProviderId,
    tz,
};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = ingest_checkpoint, check_for_backend(diesel::sqlite::Sqlite))]
struct CheckpointRow {
    symbol: String,
    timeframe: String,
    provider: String,
    committed_ts: Option<String>,
    state: String,
    last_error: Option<String>,
    updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = ingest_checkpoint)]
struct NewCheckpointRow<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    provider: &'a str,
    committed_ts: Option<&'a str>,
    state: &'a str,
    last_error: Option<&'a str>,
    updated_at: &'a str,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = anyhow::Error;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let timeframe = row
            .timeframe
            .parse()
            .with_context(|| format!("bad timeframe in checkpoint row for {}", row.symbol))?;
        Ok(Checkpoint {
            key: SeriesKey::new(row.symbol, timeframe),
            provider: row.provider,
            committed: row
                .committed_ts
                .as_deref()
                .map(tz::parse_ts_to_utc)
                .transpose()?,
            state: row.state.parse()?,
            last_error: row.last_error,
            updated_at: tz::parse_ts_to_utc(&row.updated_at)?,
        })
    }
}

/// Checkpoint repository backed by the `ingest_checkpoint` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteRepo;

impl SqliteRepo {
    /// Stateless; the connection is passed per call.
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointRepo for SqliteRepo {
    fn load_all(&self, conn: &mut SqliteConnection) -> RepoResult<Vec<Checkpoint>> {
        ic::ingest_checkpoint
            .order((ic::symbol.asc(), ic::timeframe.asc()))
            .select(CheckpointRow::as_select())
            .load(conn)?
            .into_iter()
            .map(Checkpoint::try_from)
            .collect()
    }

    fn load(&self, conn: &mut SqliteConnection, key: &SeriesKey) -> RepoResult<Option<Checkpoint>> {
        ic::ingest_checkpoint
            .find((key.symbol.as_str(), key.timeframe.to_string()))
            .select(CheckpointRow::as_select())
            .first(conn)
            .optional()?
            .map(Checkpoint::try_from)
            .transpose()
    }

    fn advance(
        &self,
        conn: &mut SqliteConnection,
        key: &SeriesKey,
        provider: ProviderId,
        committed: DateTime<Utc>,
    ) -> RepoResult<DateTime<Utc>> {
        let timeframe = key.timeframe.to_string();
        conn.immediate_transaction(|conn| {
            let stored: Option<Option<String>> = ic::ingest_checkpoint
                .find((key.symbol.as_str(), timeframe.as_str()))
                .select(ic::committed_ts)
                .first(conn)
                .optional()?;
            if let Some(current) = stored.flatten() {
                let current = tz::parse_ts_to_utc(&current)?;
                if current >= committed {
                    return Ok(current);
                }
            }

            let committed_text = tz::to_rfc3339_millis(committed);
            let now = tz::to_rfc3339_millis(Utc::now());
            let row = NewCheckpointRow {
                symbol: &key.symbol,
                timeframe: &timeframe,
                provider: provider.as_str(),
                committed_ts: Some(&committed_text),
                state: JobState::Running.as_str(),
                last_error: None,
                updated_at: &now,
            };
            diesel::insert_into(ic::ingest_checkpoint)
                .values(&row)
                .on_conflict((ic::symbol, ic::timeframe))
                .do_update()
                .set((
                    ic::provider.eq(provider.as_str()),
                    ic::committed_ts.eq(Some(committed_text.as_str())),
                    ic::updated_at.eq(now.as_str()),
                ))
                .execute(conn)?;
            Ok(committed)
        })
    }

    fn record_state(
        &self,
        conn: &mut SqliteConnection,
        key: &SeriesKey,
        provider: ProviderId,
        state: JobState,
        last_error: Option<&str>,
    ) -> RepoResult<()> {
        let timeframe = key.timeframe.to_string();
        let now = tz::to_rfc3339_millis(Utc::now());
        let row = NewCheckpointRow {
            symbol: &key.symbol,
            timeframe: &timeframe,
            provider: provider.as_str(),
            committed_ts: None,
            state: state.as_str(),
            last_error,
            updated_at: &now,
        };
        diesel::insert_into(ic::ingest_checkpoint)
            .values(&row)
            .on_conflict((ic::symbol, ic::timeframe))
            .do_update()
            .set((
                ic::provider.eq(provider.as_str()),
                ic::state.eq(state.as_str()),
                ic::last_error.eq(last_error),
                ic::updated_at.eq(now.as_str()),
            ))
            .execute(conn)?;
        Ok(())
    }
}
