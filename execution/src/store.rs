//! SQLite-backed storage shared by every economy component.
//!
//! Each mutating operation runs inside one `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock before the first read. That lock is what makes
//! check-then-debit atomic in the ledger and what serializes stock decrements in
//! the draw resolver. A lock wait longer than the configured busy timeout fails
//! with `SQLITE_BUSY` and surfaces as [`EconomyError::LockNotAcquired`].
//!
//! Connections are opened per worker and recycled through a small idle list, so
//! a [`Store`] can be shared across threads behind an `Arc`.

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::EconomyError;

/// Default lock-wait timeout for a single attempt.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default number of idle connections kept for reuse.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS wallet_accounts (
        user_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        updated_at_ms INTEGER NOT NULL,
        PRIMARY KEY (user_id, token)
    );
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        delta INTEGER NOT NULL,
        balance_after INTEGER NOT NULL,
        reason TEXT NOT NULL,
        label TEXT,
        meta TEXT NOT NULL,
        source_key TEXT,
        created_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ledger_entries_account
        ON ledger_entries(user_id, token, id);
    CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_source
        ON ledger_entries(user_id, token, source_key) WHERE source_key IS NOT NULL;
    CREATE TABLE IF NOT EXISTS trial_buckets (
        user_id INTEGER NOT NULL,
        token TEXT NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        updated_at_ms INTEGER NOT NULL,
        PRIMARY KEY (user_id, token)
    );
    CREATE TABLE IF NOT EXISTS idempotency_records (
        actor TEXT NOT NULL,
        scope TEXT NOT NULL,
        key TEXT NOT NULL,
        request_hash TEXT NOT NULL,
        status TEXT NOT NULL,
        response TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        PRIMARY KEY (actor, scope, key)
    );
    CREATE TABLE IF NOT EXISTS draw_pools (
        pool_id TEXT PRIMARY KEY,
        slot_count INTEGER,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS draw_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pool_id TEXT NOT NULL REFERENCES draw_pools(pool_id),
        label TEXT NOT NULL,
        reward_kind TEXT NOT NULL,
        reward_amount INTEGER NOT NULL,
        weight INTEGER NOT NULL,
        stock INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS draw_items_pool ON draw_items(pool_id, active);
    CREATE TABLE IF NOT EXISTS earn_events (
        identity TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        amount INTEGER NOT NULL,
        earn_type TEXT NOT NULL,
        payout TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS earn_events_user ON earn_events(user_id);
    CREATE TABLE IF NOT EXISTS vault_states (
        user_id INTEGER PRIMARY KEY,
        locked_balance INTEGER NOT NULL DEFAULT 0 CHECK (locked_balance >= 0),
        available_balance INTEGER NOT NULL DEFAULT 0 CHECK (available_balance >= 0),
        locked_expires_at_ms INTEGER,
        updated_at_ms INTEGER NOT NULL
    );";

/// Connection settings for [`Store::open`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Busy timeout applied to every connection (lock-wait bound per attempt).
    pub lock_timeout: Duration,
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
        }
    }
}

pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    idle: Mutex<Vec<Connection>>,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EconomyError> {
        let store = Self {
            path: path.to_path_buf(),
            config,
            idle: Mutex::new(Vec::new()),
            clock,
        };
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        store.release(conn);
        debug!(path = %store.path.display(), "economy store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn connect(&self) -> Result<Connection, EconomyError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.config.lock_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    fn acquire(&self) -> Result<Connection, EconomyError> {
        let reused = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        match reused {
            Some(conn) => Ok(conn),
            None => self.connect(),
        }
    }

    fn release(&self, conn: Connection) {
        let mut idle = match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        };
        if idle.len() < self.config.max_idle_connections {
            idle.push(conn);
        }
    }

    /// Run `f` on a pooled connection outside any explicit transaction.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, EconomyError>,
    ) -> Result<T, EconomyError> {
        let conn = self.acquire()?;
        let result = f(&conn);
        self.release(conn);
        result
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise,
    /// so a failed operation never leaves partial writes behind.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, EconomyError>,
    ) -> Result<T, EconomyError> {
        let mut conn = self.acquire()?;
        let result = run_immediate(&mut conn, f);
        self.release(conn);
        result
    }
}

fn run_immediate<T>(
    conn: &mut Connection,
    f: impl FnOnce(&mut Transaction<'_>) -> Result<T, EconomyError>,
) -> Result<T, EconomyError> {
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&mut tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    /// Store backed by a file in a fresh temporary directory.
    pub(crate) struct TestStore {
        pub store: Arc<Store>,
        pub clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    pub(crate) fn test_store() -> TestStore {
        test_store_with(StoreConfig::default())
    }

    pub(crate) fn test_store_with(config: StoreConfig) -> TestStore {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Store::open(&dir.path().join("economy.db"), config, clock.clone())
            .expect("open store");
        TestStore {
            store: Arc::new(store),
            clock,
            _dir: dir,
        }
    }
}
