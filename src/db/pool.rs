//! Connection pooling via `r2d2` + `r2d2_sqlite`, implementing the
//! configurable-size pool contract: connections are leased for the
//! span of one transaction and returned on any exit path.

use std::time::Duration;

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{VaultError, VaultResult};

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Pool {
    inner: r2d2::Pool<SqliteConnectionManager>,
    acquire_timeout: Duration,
}

impl Pool {
    pub fn open(db_path: &std::path::Path, pool_size: u32) -> VaultResult<Pool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
        });
        let inner = r2d2::Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)
            .map_err(|e| VaultError::FatalIo(e.to_string()))?;
        let pool = Pool {
            inner,
            acquire_timeout: Duration::from_secs(30),
        };
        pool.with_conn(|conn| crate::db::schema::create_all(conn))?;
        Ok(pool)
    }

    fn acquire(&self) -> VaultResult<PooledConn> {
        self.inner
            .get_timeout(self.acquire_timeout)
            .map_err(VaultError::from)
    }

    /// Leases a connection for the duration of `f`. On timeout the
    /// operation fails with `Busy` rather than blocking indefinitely.
    pub fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> VaultResult<T>) -> VaultResult<T> {
        let conn = self.acquire()?;
        f(&conn)
    }

    /// Runs `f` inside one transaction; any error bubbled from `f` rolls
    /// the transaction back before being returned (the parent-stats
    /// propagation done inside `f` is therefore atomic with the
    /// triggering mutation).
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut conn = self.acquire()?;
        let txn = conn.transaction().map_err(VaultError::from)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(VaultError::from)?;
                Ok(value)
            }
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }
}
