//! Thin façade over the embedded relational engine (component C4).
//!
//! Everything the rest of the crate needs from SQLite is funneled through
//! this module: prepare/step, scalar function registration, virtual-table
//! module registration, savepoints, and commit/rollback callbacks. No other
//! module touches `rusqlite` directly, mirroring the source engine's
//! `SqliteEngine` wrapper boundary.

use rusqlite::vtab::{CreateVTab, Module};
use rusqlite::{Connection, OpenFlags};
use std::sync::{Arc, Mutex};
use tracedb_core::status::{Result, TraceDbError};
use tracing::{debug, warn};

use crate::sync_cell::SyncCell;

/// Callback invoked after a successful COMMIT; used to forward the
/// notification to every registered virtual-table module's connection
/// state (§4.4).
pub type CommitCallback = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked after a ROLLBACK.
pub type RollbackCallback = Arc<dyn Fn() + Send + Sync>;

/// A registered virtual-table module's hook into commit/rollback
/// notification. None of this crate's modules (table-valued functions,
/// rollup, pivot) hold per-instance state that outlives a single query — the
/// tree each cursor reads is rebuilt fresh at `CREATE VIRTUAL TABLE` time —
/// so the one real piece of "module state" a commit/rollback can invalidate
/// is SQLite's own prepared-statement cache for the connection; see
/// [`SqlEngine::notify_commit`]/[`SqlEngine::notify_rollback`]. The trait
/// exists for modules that *do* need per-instance notification; none are
/// registered against it today.
pub trait VtabStateManager: Send + Sync {
    fn on_commit(&self) {}
    fn on_rollback(&self) {}
}

/// Wraps a single `rusqlite::Connection`. Not `Clone`; shared via `Arc` at
/// the call sites that need a `Send + Sync + 'static` handle (scalar
/// function closures, virtual-table module `Aux` data) — see
/// [`SqlEngine::shared_connection`] and [`crate::sync_cell`] for why a
/// `Mutex` would deadlock on this engine's re-entrant call pattern instead.
pub struct SqlEngine {
    conn: Arc<SyncCell<Connection>>,
    commit_cb: Mutex<Option<CommitCallback>>,
    rollback_cb: Mutex<Option<RollbackCallback>>,
    savepoint_counter: Mutex<u64>,
    vtab_state_managers: Mutex<Vec<Arc<dyn VtabStateManager>>>,
}

impl SqlEngine {
    /// Opens an in-memory database, the only mode this core uses: the
    /// engine never owns a file on disk (§6.3).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory_with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| TraceDbError::engine(format!("failed to open connection: {e}")))?;
        Ok(Self {
            conn: Arc::new(SyncCell::new(conn)),
            commit_cb: Mutex::new(None),
            rollback_cb: Mutex::new(None),
            savepoint_counter: Mutex::new(0),
            vtab_state_managers: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self) -> &Connection {
        self.conn.get()
    }

    /// A shared, `Send + Sync + 'static` handle to the embedded connection,
    /// for capturing in `rusqlite` scalar-function closures and
    /// virtual-table `Aux` types, which both require that bound.
    pub fn shared_connection(&self) -> Arc<SyncCell<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Registers a `rusqlite::vtab` module under `name`, generic over the
    /// concrete `VTab` implementation (`TableFunctionVTab`, `RollupVTab`,
    /// `PivotVTab`). `kind` selects eponymous-only (table-valued functions,
    /// reachable as `FROM name(...)` with no `CREATE VIRTUAL TABLE` step) vs.
    /// default (rollup/pivot, reachable after an explicit `CREATE VIRTUAL
    /// TABLE ... USING name(...)`).
    pub fn register_virtual_table_module<'vtab, T: CreateVTab<'vtab>>(
        &self,
        name: &str,
        module: &'static Module<'vtab, T>,
        aux: T::Aux,
    ) -> Result<()> {
        self.conn
            .get()
            .create_module(name, module, Some(aux))
            .map_err(|e| TraceDbError::engine(format!("failed to register virtual table module {name}: {e}")))
    }

    /// Registers a `VtabStateManager` to receive commit/rollback
    /// notifications alongside the connection-wide statement cache flush.
    pub fn register_vtab_state_manager(&self, manager: Arc<dyn VtabStateManager>) {
        self.vtab_state_managers.lock().unwrap().push(manager);
    }

    pub fn set_commit_callback(&self, cb: CommitCallback) {
        *self.commit_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_rollback_callback(&self, cb: RollbackCallback) {
        *self.rollback_cb.lock().unwrap() = Some(cb);
    }

    /// Executes a batch of SQL with no result rows expected; used for the
    /// native-statement rewrite passthrough (`SELECT 0 WHERE 0`) and for DDL
    /// issued internally (creating the backing shadow tables for a runtime
    /// table registration, for instance).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .get()
            .execute_batch(sql)
            .map_err(|e| TraceDbError::engine(format!("{e} while executing: {sql}")))
    }

    /// Runs `body` inside a uniquely-named SAVEPOINT, committing it (RELEASE)
    /// on `Ok` and rolling it back on `Err`. If the rollback itself fails,
    /// the failure is logged and the *original* error is still what's
    /// returned to the caller — escalating this to Fatal is a documented
    /// open question (see DESIGN.md) that this implementation resolves by
    /// keeping the source engine's log-and-continue behavior.
    pub fn with_savepoint<T>(&self, label: &str, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let name = {
            let mut counter = self.savepoint_counter.lock().unwrap();
            *counter += 1;
            format!("tracedb_sp_{label}_{counter}")
        };
        self.execute_batch(&format!("SAVEPOINT {name}"))?;
        match body() {
            Ok(value) => {
                self.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(original_err) => {
                if let Err(rollback_err) =
                    self.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    warn!(
                        savepoint = %name,
                        rollback_error = %rollback_err,
                        "rollback after failed savepoint itself failed; database state unverified"
                    );
                }
                Err(original_err)
            }
        }
    }

    /// Notifies the commit callback, if one is registered, and every
    /// registered virtual-table state manager. Called by engine code
    /// immediately after an explicit `COMMIT` statement completes.
    pub fn notify_commit(&self) {
        debug!("notifying commit callback");
        if let Some(cb) = self.commit_cb.lock().unwrap().as_ref() {
            cb();
        }
        for manager in self.vtab_state_managers.lock().unwrap().iter() {
            manager.on_commit();
        }
    }

    /// Notifies the rollback callback, if one is registered, every
    /// registered virtual-table state manager, and flushes the connection's
    /// prepared-statement cache — the one piece of genuinely shared
    /// virtual-table-module state a rollback can leave stale, since a rolled
    /// back `CREATE VIRTUAL TABLE` can leave a cached statement referencing a
    /// table that no longer exists (§4.4).
    pub fn notify_rollback(&self) {
        debug!("notifying rollback callback");
        if let Some(cb) = self.rollback_cb.lock().unwrap().as_ref() {
            cb();
        }
        for manager in self.vtab_state_managers.lock().unwrap().iter() {
            manager.on_rollback();
        }
        self.conn.get().flush_prepared_statement_cache();
    }

    /// Registers a deterministic scalar SQL function. `argc` follows
    /// SQLite's convention: `-1` means variadic.
    pub fn register_scalar_function<F>(&self, name: &str, argc: i32, deterministic: bool, func: F) -> Result<()>
    where
        F: Fn(&rusqlite::functions::Context<'_>) -> rusqlite::Result<rusqlite::types::Value>
            + Send
            + Sync
            + 'static,
    {
        use rusqlite::functions::FunctionFlags;
        let flags = if deterministic {
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
        } else {
            FunctionFlags::SQLITE_UTF8
        };
        self.conn
            .get()
            .create_scalar_function(name, argc, flags, func)
            .map_err(|e| TraceDbError::engine(format!("failed to register function {name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_commits_on_success() {
        let engine = SqlEngine::open_in_memory().unwrap();
        engine.execute_batch("CREATE TABLE t(x INT)").unwrap();
        engine
            .with_savepoint("test", || {
                engine
                    .execute_batch("INSERT INTO t VALUES (1)")
                    .map_err(|e| e)
            })
            .unwrap();
        let count: i64 = engine
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn savepoint_rolls_back_on_failure() {
        let engine = SqlEngine::open_in_memory().unwrap();
        engine.execute_batch("CREATE TABLE t(x INT)").unwrap();
        let result: Result<()> = engine.with_savepoint("test", || {
            engine.execute_batch("INSERT INTO t VALUES (1)")?;
            Err(TraceDbError::bad_argument("deliberate failure"))
        });
        assert!(result.is_err());
        let count: i64 = engine
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn commit_callback_is_invoked() {
        let engine = SqlEngine::open_in_memory().unwrap();
        let flag = Arc::new(Mutex::new(false));
        let flag2 = flag.clone();
        engine.set_commit_callback(Arc::new(move || {
            *flag2.lock().unwrap() = true;
        }));
        engine.notify_commit();
        assert!(*flag.lock().unwrap());
    }
}
