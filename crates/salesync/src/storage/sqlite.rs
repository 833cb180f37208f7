//! SQLite-based sales storage

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{LockAcquisition, LockManager, SalesStore, merge_sale};
use crate::models::{
    Account, Carrier, HistoryCursor, MessageId, OAuthToken, SaleRecord, SaleStatus, SyncState,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Connected mailboxes and their OAuth grant
            CREATE TABLE accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                added_at TEXT NOT NULL,
                access_token TEXT,
                refresh_token TEXT,
                token_expires_at INTEGER
            );

            -- Sync state per account, including the advisory lock
            CREATE TABLE sync_state (
                account_id TEXT PRIMARY KEY,
                history_cursor TEXT,
                last_sync_at TEXT,
                lock_holder TEXT,
                lock_acquired_at TEXT,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                paused_until TEXT,
                reauth_required INTEGER NOT NULL DEFAULT 0,
                sync_requested INTEGER NOT NULL DEFAULT 0
            );

            -- One canonical record per (account, transaction id)
            CREATE TABLE sales (
                account_id TEXT NOT NULL,
                transaction_id TEXT NOT NULL,
                status TEXT NOT NULL,
                item TEXT,
                amount REAL NOT NULL DEFAULT 0,
                purchase_cost REAL,
                carrier TEXT NOT NULL,
                tracking_ref TEXT,
                sale_date TEXT NOT NULL,
                completion_date TEXT,
                deadline TEXT,
                message_ids TEXT NOT NULL DEFAULT '[]',
                manual INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, transaction_id)
            );

            CREATE INDEX idx_sales_pending_deadline
                ON sales(account_id, status, deadline);
            "#,
        ),
        // Migration 2: Status reporting counters
        M::up(
            r#"
            ALTER TABLE sync_state ADD COLUMN last_error TEXT;
            ALTER TABLE sync_state ADD COLUMN total_cycles INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE sync_state ADD COLUMN total_failures INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE sync_state ADD COLUMN total_created INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE sync_state ADD COLUMN total_updated INTEGER NOT NULL DEFAULT 0;
            "#,
        ),
        // Migration 3: Failed cycles count against the sync interval too
        M::up("ALTER TABLE sync_state ADD COLUMN last_attempt_at TEXT;"),
    ])
}

const SALE_COLUMNS: &str = "account_id, transaction_id, status, item, amount, purchase_cost,
     carrier, tracking_ref, sale_date, completion_date, deadline, message_ids,
     manual, created_at, updated_at";

const SYNC_STATE_COLUMNS: &str = "account_id, history_cursor, last_sync_at, lock_holder,
     lock_acquired_at, consecutive_errors, paused_until, reauth_required, sync_requested,
     last_error, total_cycles, total_failures, total_created, total_updated, last_attempt_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", s))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn parse_opt_date(s: Option<String>) -> Result<Option<NaiveDate>> {
    s.map(|s| {
        NaiveDate::parse_from_str(&s, DATE_FORMAT)
            .with_context(|| format!("Invalid date in database: {}", s))
    })
    .transpose()
}

/// A `sales` row as stored, before parsing
struct SaleRow {
    account_id: String,
    transaction_id: String,
    status: String,
    item: Option<String>,
    amount: f64,
    purchase_cost: Option<f64>,
    carrier: String,
    tracking_ref: Option<String>,
    sale_date: String,
    completion_date: Option<String>,
    deadline: Option<String>,
    message_ids: String,
    manual: bool,
    created_at: String,
    updated_at: String,
}

impl SaleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            transaction_id: row.get(1)?,
            status: row.get(2)?,
            item: row.get(3)?,
            amount: row.get(4)?,
            purchase_cost: row.get(5)?,
            carrier: row.get(6)?,
            tracking_ref: row.get(7)?,
            sale_date: row.get(8)?,
            completion_date: row.get(9)?,
            deadline: row.get(10)?,
            message_ids: row.get(11)?,
            manual: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<SaleRecord> {
        let status = SaleStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown sale status in database: {}", self.status))?;
        let message_ids: BTreeSet<MessageId> = serde_json::from_str(&self.message_ids)
            .context("Invalid message_ids JSON in database")?;

        Ok(SaleRecord {
            account_id: self.account_id,
            transaction_id: self.transaction_id,
            status,
            item: self.item,
            amount: self.amount,
            purchase_cost: self.purchase_cost,
            carrier: Carrier::parse(&self.carrier),
            tracking_ref: self.tracking_ref,
            sale_date: parse_ts(&self.sale_date)?,
            completion_date: parse_opt_date(self.completion_date)?,
            deadline: parse_opt_date(self.deadline)?,
            message_ids,
            manual: self.manual,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn load_sale(conn: &Connection, account_id: &str, transaction_id: &str) -> Result<Option<SaleRecord>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM sales WHERE account_id = ? AND transaction_id = ?",
                SALE_COLUMNS
            ),
            params![account_id, transaction_id],
            SaleRow::from_row,
        )
        .optional()?;
    row.map(SaleRow::into_record).transpose()
}

fn query_sales(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<SaleRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, SaleRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SaleRow::into_record).collect()
}

fn write_sale(conn: &Connection, record: &SaleRecord) -> Result<()> {
    // ON CONFLICT DO UPDATE keeps the row identity, unlike INSERT OR REPLACE
    conn.execute(
        &format!(
            "INSERT INTO sales ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, transaction_id) DO UPDATE SET
                status = excluded.status,
                item = excluded.item,
                amount = excluded.amount,
                purchase_cost = excluded.purchase_cost,
                carrier = excluded.carrier,
                tracking_ref = excluded.tracking_ref,
                sale_date = excluded.sale_date,
                completion_date = excluded.completion_date,
                deadline = excluded.deadline,
                message_ids = excluded.message_ids,
                manual = excluded.manual,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            SALE_COLUMNS
        ),
        sale_params(record)?,
    )?;
    Ok(())
}

/// Bind values in `SALE_COLUMNS` order
fn sale_params(record: &SaleRecord) -> Result<impl rusqlite::Params> {
    Ok((
        record.account_id.clone(),
        record.transaction_id.clone(),
        record.status.as_str(),
        record.item.clone(),
        record.amount,
        record.purchase_cost,
        record.carrier.as_str(),
        record.tracking_ref.clone(),
        format_ts(record.sale_date),
        record.completion_date.map(format_date),
        record.deadline.map(format_date),
        serde_json::to_string(&record.message_ids)?,
        record.manual,
        format_ts(record.created_at),
        format_ts(record.updated_at),
    ))
}

/// A `sync_state` row as stored, before parsing
struct SyncStateRow {
    account_id: String,
    history_cursor: Option<String>,
    last_sync_at: Option<String>,
    lock_holder: Option<String>,
    lock_acquired_at: Option<String>,
    consecutive_errors: u32,
    paused_until: Option<String>,
    reauth_required: bool,
    sync_requested: bool,
    last_error: Option<String>,
    total_cycles: i64,
    total_failures: i64,
    total_created: i64,
    total_updated: i64,
    last_attempt_at: Option<String>,
}

impl SyncStateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            history_cursor: row.get(1)?,
            last_sync_at: row.get(2)?,
            lock_holder: row.get(3)?,
            lock_acquired_at: row.get(4)?,
            consecutive_errors: row.get(5)?,
            paused_until: row.get(6)?,
            reauth_required: row.get(7)?,
            sync_requested: row.get(8)?,
            last_error: row.get(9)?,
            total_cycles: row.get(10)?,
            total_failures: row.get(11)?,
            total_created: row.get(12)?,
            total_updated: row.get(13)?,
            last_attempt_at: row.get(14)?,
        })
    }

    fn into_state(self) -> Result<SyncState> {
        Ok(SyncState {
            account_id: self.account_id,
            cursor: self.history_cursor.map(HistoryCursor::new),
            last_sync_at: parse_opt_ts(self.last_sync_at)?,
            last_attempt_at: parse_opt_ts(self.last_attempt_at)?,
            lock_holder: self.lock_holder,
            lock_acquired_at: parse_opt_ts(self.lock_acquired_at)?,
            consecutive_errors: self.consecutive_errors,
            paused_until: parse_opt_ts(self.paused_until)?,
            reauth_required: self.reauth_required,
            sync_requested: self.sync_requested,
            last_error: self.last_error,
            total_cycles: self.total_cycles.max(0) as u64,
            total_failures: self.total_failures.max(0) as u64,
            total_created: self.total_created.max(0) as u64,
            total_updated: self.total_updated.max(0) as u64,
        })
    }
}

/// SQLite-based sales storage
///
/// Several daemon processes may share one database file; lock acquisition
/// and sale upserts run in IMMEDIATE transactions so the read-decide-write
/// sequence is atomic across connections.
pub struct SqliteSalesStore {
    conn: Mutex<Connection>,
}

impl SqliteSalesStore {
    /// Open (or create) the database at `db_path` and apply migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers (the status endpoint) run during sync writes;
        // busy_timeout makes competing writers wait instead of failing.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
    }
}

impl LockManager for SqliteSalesStore {
    fn try_acquire_lock(
        &self,
        account_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<LockAcquisition> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Sync state is created on the first sync attempt
        tx.execute(
            "INSERT INTO sync_state (account_id) VALUES (?) ON CONFLICT(account_id) DO NOTHING",
            [account_id],
        )?;

        let (current, acquired_at): (Option<String>, Option<String>) = tx.query_row(
            "SELECT lock_holder, lock_acquired_at FROM sync_state WHERE account_id = ?",
            [account_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let acquired_at = parse_opt_ts(acquired_at)?;

        let outcome = match current {
            Some(current) if current != holder => {
                let live = acquired_at.is_none_or(|at| now - at < stale_after);
                if live {
                    return Ok(LockAcquisition::Held {
                        holder: current,
                        since: acquired_at,
                    });
                }
                LockAcquisition::Recovered {
                    previous_holder: current,
                }
            }
            _ => LockAcquisition::Acquired,
        };

        tx.execute(
            "UPDATE sync_state SET lock_holder = ?, lock_acquired_at = ? WHERE account_id = ?",
            params![holder, format_ts(now), account_id],
        )?;
        tx.commit()?;

        Ok(outcome)
    }

    fn renew_lock(&self, account_id: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_state SET lock_acquired_at = ? WHERE account_id = ? AND lock_holder = ?",
            params![format_ts(now), account_id, holder],
        )?;
        Ok(changed == 1)
    }

    fn release_lock(&self, account_id: &str, holder: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_state SET lock_holder = NULL, lock_acquired_at = NULL
             WHERE account_id = ? AND lock_holder = ?",
            params![account_id, holder],
        )?;
        Ok(())
    }
}

impl SalesStore for SqliteSalesStore {
    fn upsert_account(&self, account: Account) -> Result<()> {
        let conn = self.conn()?;
        let token = account.token.as_ref();
        conn.execute(
            "INSERT INTO accounts (id, email, added_at, access_token, refresh_token, token_expires_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_expires_at = excluded.token_expires_at",
            params![
                account.id,
                account.email,
                format_ts(account.added_at),
                token.map(|t| t.access_token.as_str()),
                token.and_then(|t| t.refresh_token.as_deref()),
                token.and_then(|t| t.expires_at),
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, added_at, access_token, refresh_token, token_expires_at
             FROM accounts WHERE id = ?",
        )?;
        let mut accounts = read_accounts(&mut stmt, [account_id])?;
        Ok(accounts.pop())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, email, added_at, access_token, refresh_token, token_expires_at
             FROM accounts ORDER BY id",
        )?;
        read_accounts(&mut stmt, [])
    }

    fn save_account_token(&self, account_id: &str, token: &OAuthToken) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts SET access_token = ?, refresh_token = ?, token_expires_at = ?
             WHERE id = ?",
            params![
                token.access_token,
                token.refresh_token,
                token.expires_at,
                account_id
            ],
        )?;
        if changed == 0 {
            bail!("Account {} not found", account_id);
        }
        Ok(())
    }

    fn get_sync_state(&self, account_id: &str) -> Result<Option<SyncState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sync_state WHERE account_id = ?",
                    SYNC_STATE_COLUMNS
                ),
                [account_id],
                SyncStateRow::from_row,
            )
            .optional()?;
        row.map(SyncStateRow::into_state).transpose()
    }

    fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        let conn = self.conn()?;

        // Lock columns are deliberately absent from both lists
        conn.execute(
            "INSERT INTO sync_state
             (account_id, history_cursor, last_sync_at, consecutive_errors, paused_until,
              reauth_required, sync_requested, last_error, total_cycles, total_failures,
              total_created, total_updated, last_attempt_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                history_cursor = excluded.history_cursor,
                last_sync_at = excluded.last_sync_at,
                consecutive_errors = excluded.consecutive_errors,
                paused_until = excluded.paused_until,
                reauth_required = excluded.reauth_required,
                sync_requested = excluded.sync_requested,
                last_error = excluded.last_error,
                total_cycles = excluded.total_cycles,
                total_failures = excluded.total_failures,
                total_created = excluded.total_created,
                total_updated = excluded.total_updated,
                last_attempt_at = excluded.last_attempt_at",
            params![
                state.account_id,
                state.cursor.as_ref().map(|c| c.as_str()),
                state.last_sync_at.map(format_ts),
                state.consecutive_errors,
                state.paused_until.map(format_ts),
                state.reauth_required,
                state.sync_requested,
                state.last_error,
                state.total_cycles as i64,
                state.total_failures as i64,
                state.total_created as i64,
                state.total_updated as i64,
                state.last_attempt_at.map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn request_sync(&self, account_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_state (account_id, sync_requested) VALUES (?, 1)
             ON CONFLICT(account_id) DO UPDATE SET sync_requested = 1",
            [account_id],
        )?;
        Ok(())
    }

    fn clear_reauth(&self, account_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_state SET reauth_required = 0, last_error = NULL WHERE account_id = ?",
            [account_id],
        )?;
        Ok(())
    }

    fn upsert_sale(&self, record: SaleRecord, now: DateTime<Utc>) -> Result<Option<SaleRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = load_sale(&tx, &record.account_id, &record.transaction_id)?;
        let merged = merge_sale(existing.as_ref(), record, now);
        if let Some(merged) = &merged {
            write_sale(&tx, merged)?;
        }

        tx.commit()?;
        Ok(merged)
    }

    fn get_sale(&self, account_id: &str, transaction_id: &str) -> Result<Option<SaleRecord>> {
        let conn = self.conn()?;
        load_sale(&conn, account_id, transaction_id)
    }

    fn list_sales(&self, account_id: &str) -> Result<Vec<SaleRecord>> {
        let conn = self.conn()?;
        query_sales(
            &conn,
            &format!(
                "SELECT {} FROM sales WHERE account_id = ? ORDER BY sale_date ASC, transaction_id ASC",
                SALE_COLUMNS
            ),
            [account_id],
        )
    }

    fn list_overdue_pending(&self, account_id: &str, today: NaiveDate) -> Result<Vec<SaleRecord>> {
        let conn = self.conn()?;
        query_sales(
            &conn,
            &format!(
                "SELECT {} FROM sales
                 WHERE account_id = ? AND status = 'pending' AND manual = 0
                   AND deadline IS NOT NULL AND deadline < ?
                 ORDER BY deadline ASC",
                SALE_COLUMNS
            ),
            params![account_id, format_date(today)],
        )
    }

    fn insert_sale_if_absent(&self, record: &SaleRecord) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO sales ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account_id, transaction_id) DO NOTHING",
                SALE_COLUMNS
            ),
            sale_params(record)?,
        )?;
        Ok(inserted == 1)
    }

    fn replace_manual_sale(&self, record: &SaleRecord) -> Result<bool> {
        let conn = self.conn()?;
        // Both the stored row and the replacement (?13) must be manual
        let changed = conn.execute(
            "UPDATE sales SET
                status = ?3, item = ?4, amount = ?5, purchase_cost = ?6, carrier = ?7,
                tracking_ref = ?8, sale_date = ?9, completion_date = ?10, deadline = ?11,
                message_ids = ?12, created_at = ?14, updated_at = ?15
             WHERE account_id = ?1 AND transaction_id = ?2 AND manual = 1 AND ?13 = 1",
            sale_params(record)?,
        )?;
        Ok(changed == 1)
    }

    fn set_purchase_cost(
        &self,
        account_id: &str,
        transaction_id: &str,
        cost: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<SaleRecord>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE sales SET purchase_cost = ?1, updated_at = ?2
             WHERE account_id = ?3 AND transaction_id = ?4 AND purchase_cost IS NOT ?1",
            params![cost, format_ts(now), account_id, transaction_id],
        )?;
        let stored = load_sale(&tx, account_id, transaction_id)?;
        tx.commit()?;
        Ok(stored)
    }

    fn delete_sale(&self, account_id: &str, transaction_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM sales WHERE account_id = ? AND transaction_id = ?",
            params![account_id, transaction_id],
        )?;
        Ok(deleted > 0)
    }
}

fn read_accounts(stmt: &mut rusqlite::Statement<'_>, args: impl rusqlite::Params) -> Result<Vec<Account>> {
    #[allow(clippy::type_complexity)]
    let rows: Vec<(String, String, String, Option<String>, Option<String>, Option<i64>)> = stmt
        .query_map(args, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, email, added_at, access_token, refresh_token, expires_at)| {
            Ok(Account {
                id,
                email,
                added_at: parse_ts(&added_at)?,
                token: access_token.map(|access_token| OAuthToken {
                    access_token,
                    refresh_token,
                    expires_at,
                }),
            })
        })
        .collect()
}
