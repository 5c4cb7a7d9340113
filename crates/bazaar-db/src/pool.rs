//! # SQLite Pool
//!
//! One shared `SqlitePool` serves the order service, the expiry sweeper and
//! the seed tool.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DbConfig ── connect_options() ── WAL · NORMAL sync · FKs · busy wait   │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  Database { pool }                                                      │
//! │     ├── listings()      ListingRepository   (+ StockLedger on conns)    │
//! │     ├── reservations()  ReservationManager                              │
//! │     ├── orders()        OrderRepository                                 │
//! │     ├── carts()         CartRepository                                  │
//! │     ├── movements()     MovementRepository                              │
//! │     └── pool()          begin() for cross-repository transactions       │
//! │                                                                         │
//! │  ":memory:" ─► exactly one connection, never recycled                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! WAL mode lets readers run alongside the single writer. Writers queue on
//! SQLite's write lock for up to `busy_timeout`; every checkout transaction
//! starts with a write so it never has to upgrade a stale read snapshot.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations::{self, MigrationStatus};
use crate::repository::cart::CartRepository;
use crate::repository::listing::ListingRepository;
use crate::repository::movement::MovementRepository;
use crate::repository::order::OrderRepository;
use crate::repository::reservation::ReservationManager;

const MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Pool and connection settings.
///
/// ```rust
/// use bazaar_db::DbConfig;
///
/// let config = DbConfig::new("/var/lib/bazaar/bazaar.db").max_connections(8);
/// assert_eq!(config.max_connections, 8);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file, created on first connect; `:memory:` for tests.
    pub database_path: PathBuf,

    /// Upper bound on open connections (5).
    pub max_connections: u32,

    /// Connections kept warm (1).
    pub min_connections: u32,

    /// How long `acquire` waits for a free connection (30 s).
    pub connect_timeout: Duration,

    /// How long a writer waits on SQLite's write lock before failing busy (10 s).
    pub busy_timeout: Duration,

    /// Idle connections are closed after this; `None` keeps them (10 min).
    pub idle_timeout: Option<Duration>,

    /// Apply embedded migrations in `Database::new` (true).
    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed defaults for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the write-lock wait.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Throwaway database for tests.
    ///
    /// An in-memory database lives and dies with its single connection, so the
    /// pool holds exactly one and never lets it idle out.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(MEMORY_PATH),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: None,
            run_migrations: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let url = if self.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.database_path.display())
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            // WAL: readers don't block the writer
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // order_items and reservations reference listings
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
            .create_if_missing(true);

        Ok(options)
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, brings the schema up to date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let connect_options = config.connect_options()?;
        debug!(path = %config.database_path.display(), "Opening SQLite pool");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(if config.is_in_memory() {
                None
            } else {
                Some(Duration::from_secs(30 * 60))
            })
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            path = %config.database_path.display(),
            max_connections = config.max_connections,
            in_memory = config.is_in_memory(),
            "SQLite pool ready"
        );

        let db = Database { pool };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Applies pending schema migrations. Safe to call repeatedly.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub async fn schema_status(&self) -> DbResult<MigrationStatus> {
        migrations::migration_status(&self.pool).await
    }

    /// The shared pool; checkout opens its cross-repository transactions here.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn listings(&self) -> ListingRepository {
        ListingRepository::new(self.pool.clone())
    }

    pub fn reservations(&self) -> ReservationManager {
        ReservationManager::new(self.pool.clone())
    }

    pub fn orders(&self) -> OrderRepository {
        OrderRepository::new(self.pool.clone())
    }

    pub fn movements(&self) -> MovementRepository {
        MovementRepository::new(self.pool.clone())
    }

    pub fn carts(&self) -> CartRepository {
        CartRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) {
        info!("Closing database pool");
        self.pool.close().await;
    }

    /// True when a connection can be acquired and answers a trivial query.
    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
