pub mod idempotency;
pub mod migrations;
pub mod store;

use anyhow::{Context, Result};
use directories::BaseDirs;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{GraphError, GraphResult};

pub use idempotency::IdempotencyCache;
pub use store::Store;

/// Path value that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Handle to the DuckDB database holding conversation graphs.
///
/// The mutex only serialises access to the single connection. It is not a
/// graph lock: cross-request safety comes from the branch version CAS and
/// from per-mutation transactions.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
}

impl Persistence {
    /// Create or open the database at the provided path and run migrations.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if db_path.as_ref().as_os_str() == IN_MEMORY {
            return Self::in_memory();
        }
        let db_path = expand_tilde(db_path.as_ref())?;
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir).context("creating DB directory")?;
        }
        let conn = Connection::open(&db_path).context("opening DuckDB")?;
        Self::from_connection(conn)
    }

    /// Open a throwaway in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory DuckDB")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrations::run(&conn).context("running migrations")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Checkpoint the database to ensure all WAL data is written to the main database file.
    /// Call this before shutdown to ensure clean database state.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("CHECKPOINT;")
            .context("checkpointing database")
    }

    /// Exclusive access to the underlying connection.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("database connection mutex poisoned")
    }

    /// Run `f` inside one transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error drops
    /// it, which rolls every write back.
    pub fn transaction<T, F>(&self, f: F) -> GraphResult<T>
    where
        F: FnOnce(&Store<'_>) -> GraphResult<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let out = f(&Store::new(&tx))?;
        tx.commit()?;
        Ok(out)
    }

    /// Run read-only work against the connection without opening a transaction.
    pub fn read<T, F>(&self, f: F) -> GraphResult<T>
    where
        F: FnOnce(&Store<'_>) -> GraphResult<T>,
    {
        let conn = self.conn();
        f(&Store::new(&conn))
    }

    /// Idempotency cache sharing this database.
    pub fn idempotency(&self) -> IdempotencyCache {
        IdempotencyCache::new(self.clone())
    }
}

/// Run blocking database work on tokio's blocking pool so async workers
/// keep serving streams while DuckDB holds the connection.
pub async fn run_blocking<T, F>(f: F) -> GraphResult<T>
where
    F: FnOnce() -> GraphResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GraphError::Internal(format!("task join error: {}", e)))?
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if path_str == "~" {
        let base = BaseDirs::new().context("base directories not available")?;
        Ok(base.home_dir().to_path_buf())
    } else if let Some(stripped) = path_str.strip_prefix("~/") {
        let base = BaseDirs::new().context("base directories not available")?;
        Ok(base.home_dir().join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
