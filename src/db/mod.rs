//! Signal ledger: durable signal status and leg records keyed by fingerprint.
//!
//! Stores everything needed to resume after restart:
//! - Signal status with compare-and-set transitions
//! - The validated signal payload (for breakeven triggers after restart)
//! - Every planned leg with its ticket and state

mod memory;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;

use crate::api::Ticket;
use crate::models::{Direction, EntryMode, Fingerprint, LegRecord, LegState, Signal, SignalStatus};

pub use memory::MemoryLedger;

/// Ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: SignalStatus, to: SignalStatus },

    #[error("unknown signal {0}")]
    UnknownSignal(Fingerprint),
}

/// Summary row of a ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub fingerprint: Fingerprint,
    pub symbol: String,
    pub direction: Direction,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent store shared by the planner, supervisor and target detector.
///
/// All status writes go through [`SignalLedger::try_set`], a compare-and-set
/// that only succeeds when the stored status still equals `from`.
#[async_trait]
pub trait SignalLedger: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<SignalStatus>, LedgerError>;

    /// Claim a fingerprint in `pending`. Returns false if it already exists.
    async fn insert_pending(&self, signal: &Signal) -> Result<bool, LedgerError>;

    /// Compare-and-set on status. Illegal transitions are an error; a lost
    /// race returns `Ok(false)`.
    async fn try_set(
        &self,
        fingerprint: &Fingerprint,
        from: SignalStatus,
        to: SignalStatus,
    ) -> Result<bool, LedgerError>;

    async fn signal(&self, fingerprint: &Fingerprint) -> Result<Option<Signal>, LedgerError>;

    async fn entries(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Insert or replace a leg record.
    async fn record_leg(&self, leg: &LegRecord) -> Result<(), LedgerError>;

    async fn legs(&self, fingerprint: &Fingerprint) -> Result<Vec<LegRecord>, LedgerError>;

    async fn leg_by_ticket(&self, ticket: Ticket) -> Result<Option<LegRecord>, LedgerError>;

    async fn legs_in_state(&self, state: LegState) -> Result<Vec<LegRecord>, LedgerError>;

    /// Compare-and-set on a leg's state.
    async fn try_set_leg_state(
        &self,
        fingerprint: &Fingerprint,
        leg: u32,
        from: LegState,
        to: LegState,
    ) -> Result<bool, LedgerError>;
}

/// Advance a signal to `to`, re-reading after every lost race.
///
/// Returns false when the stored status can no longer move to `to` (already
/// there, terminal, or past it), meaning another writer got there first.
pub async fn advance_status(
    ledger: &dyn SignalLedger,
    fingerprint: &Fingerprint,
    to: SignalStatus,
) -> Result<bool, LedgerError> {
    loop {
        let current = ledger
            .get(fingerprint)
            .await?
            .ok_or_else(|| LedgerError::UnknownSignal(fingerprint.clone()))?;
        if !current.can_advance_to(to) {
            return Ok(false);
        }
        if ledger.try_set(fingerprint, current, to).await? {
            return Ok(true);
        }
    }
}

/// SQLite-backed ledger.
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredSignal {
    fingerprint: String,
    symbol: String,
    direction: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct StoredLeg {
    fingerprint: String,
    leg: i64,
    ticket: Option<i64>,
    mode: String,
    entry_price: String,
    stop_loss: String,
    take_profit: Option<String>,
    target_level: Option<i64>,
    runner: bool,
    state: String,
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> LedgerError {
    LedgerError::Corrupt(format!("{what}: {detail}"))
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(value).map_err(|e| corrupt(field, e))
}

impl TryFrom<StoredSignal> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: StoredSignal) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            direction: row.direction.parse().map_err(|e| corrupt("direction", e))?,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            fingerprint: Fingerprint::from(row.fingerprint),
            symbol: row.symbol,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<StoredLeg> for LegRecord {
    type Error = LedgerError;

    fn try_from(row: StoredLeg) -> Result<Self, Self::Error> {
        Ok(LegRecord {
            fingerprint: Fingerprint::from(row.fingerprint),
            leg: u32::try_from(row.leg).map_err(|e| corrupt("leg", e))?,
            ticket: row
                .ticket
                .map(|t| Ticket::try_from(t).map_err(|e| corrupt("ticket", e)))
                .transpose()?,
            mode: EntryMode::from_str(&row.mode).map_err(|e| corrupt("mode", e))?,
            entry_price: parse_decimal("entry_price", &row.entry_price)?,
            stop_loss: parse_decimal("stop_loss", &row.stop_loss)?,
            take_profit: row
                .take_profit
                .as_deref()
                .map(|tp| parse_decimal("take_profit", tp))
                .transpose()?,
            target_level: row
                .target_level
                .map(|l| usize::try_from(l).map_err(|e| corrupt("target_level", e)))
                .transpose()?,
            runner: row.runner,
            state: LegState::from_str(&row.state).map_err(|e| corrupt("state", e))?,
        })
    }
}

const LEG_COLUMNS: &str = "fingerprint, leg, ticket, mode, entry_price, stop_loss, take_profit, target_level, runner, state";

impl Database {
    /// Open (and migrate) the ledger at `database_url`.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Private in-memory database; a single connection keeps one shared schema.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to signal ledger")?;

        let db = Self { pool };
        db.run_migrations()
            .await
            .context("Failed to migrate signal ledger")?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                fingerprint TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS legs (
                fingerprint TEXT NOT NULL,
                leg INTEGER NOT NULL,
                ticket INTEGER,
                mode TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT,
                target_level INTEGER,
                runner INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, leg),
                FOREIGN KEY (fingerprint) REFERENCES signals(fingerprint)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_legs_ticket ON legs(ticket)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_legs_state ON legs(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SignalLedger for Database {
    // ==================== Signals ====================

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<SignalStatus>, LedgerError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM signals WHERE fingerprint = ?")
                .bind(fingerprint.as_str())
                .fetch_optional(&self.pool)
                .await?;

        status
            .map(|s| s.parse().map_err(|e| corrupt("status", e)))
            .transpose()
    }

    async fn insert_pending(&self, signal: &Signal) -> Result<bool, LedgerError> {
        let payload = serde_json::to_string(signal).map_err(|e| corrupt("payload", e))?;
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO signals (fingerprint, symbol, direction, status, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(signal.fingerprint().as_str())
        .bind(signal.symbol())
        .bind(signal.direction().as_str())
        .bind(SignalStatus::Pending.as_str())
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_set(
        &self,
        fingerprint: &Fingerprint,
        from: SignalStatus,
        to: SignalStatus,
    ) -> Result<bool, LedgerError> {
        if !from.can_advance_to(to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }

        let result = sqlx::query(
            "UPDATE signals SET status = ?, updated_at = ? WHERE fingerprint = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(fingerprint.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn signal(&self, fingerprint: &Fingerprint) -> Result<Option<Signal>, LedgerError> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM signals WHERE fingerprint = ?")
                .bind(fingerprint.as_str())
                .fetch_optional(&self.pool)
                .await?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(|e| corrupt("payload", e)))
            .transpose()
    }

    async fn entries(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, StoredSignal>(
            r#"
            SELECT fingerprint, symbol, direction, status, created_at, updated_at
            FROM signals
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    // ==================== Legs ====================

    async fn record_leg(&self, leg: &LegRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO legs (fingerprint, leg, ticket, mode, entry_price, stop_loss, take_profit, target_level, runner, state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint, leg) DO UPDATE SET
                ticket = excluded.ticket,
                mode = excluded.mode,
                entry_price = excluded.entry_price,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                target_level = excluded.target_level,
                runner = excluded.runner,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(leg.fingerprint.as_str())
        .bind(i64::from(leg.leg))
        .bind(leg.ticket.map(|t| t as i64))
        .bind(leg.mode.as_str())
        .bind(leg.entry_price.to_string())
        .bind(leg.stop_loss.to_string())
        .bind(leg.take_profit.map(|tp| tp.to_string()))
        .bind(leg.target_level.map(|l| l as i64))
        .bind(leg.runner)
        .bind(leg.state.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn legs(&self, fingerprint: &Fingerprint) -> Result<Vec<LegRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, StoredLeg>(&format!(
            "SELECT {LEG_COLUMNS} FROM legs WHERE fingerprint = ? ORDER BY leg"
        ))
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LegRecord::try_from).collect()
    }

    async fn leg_by_ticket(&self, ticket: Ticket) -> Result<Option<LegRecord>, LedgerError> {
        let row = sqlx::query_as::<_, StoredLeg>(&format!(
            "SELECT {LEG_COLUMNS} FROM legs WHERE ticket = ?"
        ))
        .bind(ticket as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LegRecord::try_from).transpose()
    }

    async fn legs_in_state(&self, state: LegState) -> Result<Vec<LegRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, StoredLeg>(&format!(
            "SELECT {LEG_COLUMNS} FROM legs WHERE state = ? ORDER BY fingerprint, leg"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LegRecord::try_from).collect()
    }

    async fn try_set_leg_state(
        &self,
        fingerprint: &Fingerprint,
        leg: u32,
        from: LegState,
        to: LegState,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE legs SET state = ?, updated_at = ? WHERE fingerprint = ? AND leg = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(fingerprint.as_str())
        .bind(i64::from(leg))
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
