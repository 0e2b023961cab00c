#![allow(clippy::missing_errors_doc)]

//! `SQLite` persistence for frecency record sets.
//!
//! Each store key owns one record set. Every mutation rewrites the whole set
//! for its key inside a single transaction, so readers never see a partial
//! write. Independent handles on the same key are last-writer-wins: a handle
//! that loaded before another handle wrote will overwrite that write.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use profile_frecency_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, FrecencyError, FrecencyRuleset, FrecencyState,
    UsageLedger, UsageRecord,
};
use rusqlite::{params, Connection, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

const FRECENCY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_FRECENCY_V1: &str = r"
CREATE TABLE IF NOT EXISTS frecency_records (
  store_key TEXT NOT NULL,
  identifier TEXT NOT NULL,
  use_count INTEGER NOT NULL CHECK (use_count >= 1),
  first_used_at TEXT NOT NULL,
  last_used_at TEXT NOT NULL,
  PRIMARY KEY (store_key, identifier)
);
";

#[derive(Debug)]
enum Backing {
    Sqlite(Connection),
    Detached,
}

#[derive(Debug)]
pub struct SqliteFrecencyStore {
    backing: Backing,
    state: FrecencyState,
}

impl SqliteFrecencyStore {
    pub fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(conn)
    }

    pub fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_FRECENCY_V1)
            .context("failed to apply frecency schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![FRECENCY_MIGRATION_VERSION, now],
        )
        .context("failed to register frecency schema migration")?;

        Ok(())
    }

    /// Loads the record set for `store_key`, creating the schema on first use.
    pub fn load(path: &Path, store_key: &str, ruleset: FrecencyRuleset) -> Result<Self> {
        let conn = Self::open_connection(path)?;
        Self::from_connection(conn, store_key, ruleset)
    }

    pub fn from_connection(
        conn: Connection,
        store_key: &str,
        ruleset: FrecencyRuleset,
    ) -> Result<Self> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;
        Self::migrate(&conn)?;
        let state = read_state(&conn, store_key, ruleset)?;

        Ok(Self {
            backing: Backing::Sqlite(conn),
            state,
        })
    }

    /// Like [`SqliteFrecencyStore::load`] but never fails.
    ///
    /// An unopenable or corrupt database yields an empty store that is not
    /// backed by any file; every write on it returns an error. Undecodable
    /// rows yield an empty store on the same database, and the next write
    /// replaces them.
    #[must_use]
    pub fn load_or_empty(path: &Path, store_key: &str, ruleset: FrecencyRuleset) -> Self {
        let ruleset = match ruleset.validate() {
            Ok(()) => ruleset,
            Err(err) => {
                debug!(error = %err, "invalid frecency ruleset, using defaults");
                FrecencyRuleset::v1()
            }
        };

        let conn = match Self::open_connection(path).and_then(|conn| {
            Self::migrate(&conn)?;
            Ok(conn)
        }) {
            Ok(conn) => conn,
            Err(err) => {
                debug!(
                    error = %format!("{err:#}"),
                    path = %path.display(),
                    store_key,
                    "loading frecency store failed, continuing without persistence"
                );
                return Self {
                    backing: Backing::Detached,
                    state: FrecencyState::new(store_key, ruleset),
                };
            }
        };

        let state = match read_state(&conn, store_key, ruleset.clone()) {
            Ok(state) => state,
            Err(err) => {
                debug!(
                    error = %format!("{err:#}"),
                    store_key, "frecency records are unreadable, starting fresh"
                );
                FrecencyState::new(store_key, ruleset)
            }
        };

        Self {
            backing: Backing::Sqlite(conn),
            state,
        }
    }

    /// Re-reads the record set, discarding the in-memory view.
    pub fn reload(&mut self) -> Result<()> {
        let Backing::Sqlite(conn) = &self.backing else {
            return Err(detached_error(self.state.store_key()));
        };
        self.state = read_state(conn, self.state.store_key(), self.state.ruleset().clone())?;
        Ok(())
    }

    /// Records one use of `identifier` at `at` and persists the full set.
    pub fn upsert_at(&mut self, identifier: &str, at: OffsetDateTime) -> Result<()> {
        let mut next = self.state.clone();
        let evicted = next.record_use(identifier, at);
        self.persist(next)?;

        if !evicted.is_empty() {
            debug!(
                store_key = self.state.store_key(),
                evicted = ?evicted,
                "dropped frecency records beyond max_records"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> &FrecencyState {
        &self.state
    }

    #[must_use]
    pub fn store_key(&self) -> &str {
        self.state.store_key()
    }

    #[must_use]
    pub fn ruleset(&self) -> &FrecencyRuleset {
        self.state.ruleset()
    }

    /// Whether writes reach a database file.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self.backing, Backing::Sqlite(_))
    }

    fn persist(&mut self, next: FrecencyState) -> Result<()> {
        match &mut self.backing {
            Backing::Sqlite(conn) => write_state(conn, &next)?,
            Backing::Detached => return Err(detached_error(self.state.store_key())),
        }
        self.state = next;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> Option<&Connection> {
        match &self.backing {
            Backing::Sqlite(conn) => Some(conn),
            Backing::Detached => None,
        }
    }
}

impl UsageLedger for SqliteFrecencyStore {
    type Error = anyhow::Error;

    fn records(&self) -> &[UsageRecord] {
        self.state.records()
    }

    fn upsert(&mut self, identifier: &str) -> Result<()> {
        self.upsert_at(identifier, now_utc())
    }

    fn delete_all(&mut self, identifiers: &BTreeSet<String>) -> Result<()> {
        let mut next = self.state.clone();
        let removed = next.remove_all(identifiers);
        self.persist(next)?;

        debug!(
            store_key = self.state.store_key(),
            removed, "deleted frecency records"
        );
        Ok(())
    }
}

fn detached_error(store_key: &str) -> anyhow::Error {
    anyhow!("frecency store {store_key} has no durable backing")
}

fn read_state(conn: &Connection, store_key: &str, ruleset: FrecencyRuleset) -> Result<FrecencyState> {
    let mut stmt = conn
        .prepare(
            "SELECT identifier, use_count, first_used_at, last_used_at
             FROM frecency_records
             WHERE store_key = ?1
             ORDER BY identifier ASC",
        )
        .context("failed to prepare frecency record query")?;

    let rows = stmt.query_map(params![store_key], parse_record_row)?;
    let records = collect_rows(rows)
        .with_context(|| format!("failed to read frecency records for {store_key}"))?;

    FrecencyState::from_records(store_key, ruleset, records)
        .map_err(|err| anyhow!("invalid frecency records for {store_key}: {err}"))
}

fn write_state(conn: &mut Connection, state: &FrecencyState) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start frecency write transaction")?;

    tx.execute(
        "DELETE FROM frecency_records WHERE store_key = ?1",
        params![state.store_key()],
    )
    .context("failed to clear frecency records")?;

    {
        let mut insert = tx
            .prepare(
                "INSERT INTO frecency_records(
                    store_key, identifier, use_count, first_used_at, last_used_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .context("failed to prepare frecency record insert")?;

        for record in state.records() {
            insert
                .execute(params![
                    state.store_key(),
                    record.identifier,
                    i64::from(record.use_count),
                    format_rfc3339(record.first_used_at).map_err(|err| anyhow!(err.to_string()))?,
                    format_rfc3339(record.last_used_at).map_err(|err| anyhow!(err.to_string()))?,
                ])
                .with_context(|| format!("failed to insert frecency record {:?}", record.identifier))?;
        }
    }

    tx.commit().context("failed to commit frecency write transaction")?;
    Ok(())
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
    let identifier: String = row.get(0)?;
    let use_count_i64: i64 = row.get(1)?;
    let first_used_raw: String = row.get(2)?;
    let last_used_raw: String = row.get(3)?;

    let use_count = u32::try_from(use_count_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid use_count: {use_count_i64}"),
            )),
        )
    })?;

    Ok(UsageRecord {
        identifier,
        use_count,
        first_used_at: parse_rfc3339_utc(&first_used_raw).map_err(|err| to_sql_error(2, &err))?,
        last_used_at: parse_rfc3339_utc(&last_used_raw).map_err(|err| to_sql_error(3, &err))?,
    })
}

fn to_sql_error(column: usize, err: &FrecencyError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
