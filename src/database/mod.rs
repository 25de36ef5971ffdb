use crate::engine::{Engine, EngineTx, StoreSpec, TransactionMode};
use crate::error::{Result, VitrineError};
use crate::ops::{self, Delete, Insert, Update};
use crate::predicate::Predicate;
use crate::query::Select;
use crate::registry::SubscriptionRegistry;
use crate::schema::{Row, Table};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// The main entry point.
///
/// Owns the schema, the subscription registry, and the lifecycle of the
/// underlying engine connection: unopened until `open` succeeds, closed
/// again after `close`. The handle is cheap to clone; clones share one
/// connection and one registry.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .finish_non_exhaustive()
    }
}

struct DatabaseInner {
    name: String,
    version: u32,
    location: Location,
    tables: HashMap<String, Table>,
    engine: Mutex<Option<Arc<Engine>>>,
    registry: SubscriptionRegistry,
}

enum Location {
    OnDisk(PathBuf),
    InMemory,
}

impl Database {
    /// Declare a database stored at `<dir>/<name>.db`.
    /// Construction only records metadata; `open` touches storage.
    pub fn new(
        dir: impl Into<PathBuf>,
        name: &str,
        version: u32,
        tables: impl IntoIterator<Item = Table>,
    ) -> Result<Database> {
        Self::with_location(Location::OnDisk(dir.into()), name, version, tables)
    }

    /// Declare a database backed by an in-memory engine. Contents do not
    /// survive `close`.
    pub fn in_memory(
        name: &str,
        version: u32,
        tables: impl IntoIterator<Item = Table>,
    ) -> Result<Database> {
        Self::with_location(Location::InMemory, name, version, tables)
    }

    fn with_location(
        location: Location,
        name: &str,
        version: u32,
        tables: impl IntoIterator<Item = Table>,
    ) -> Result<Database> {
        if name.is_empty() {
            return Err(VitrineError::Schema("database name is empty".to_string()));
        }

        let mut registered = HashMap::new();
        for table in tables {
            let table_name = table.name().to_string();
            if registered.insert(table_name.clone(), table).is_some() {
                return Err(VitrineError::Schema(format!(
                    "table \"{table_name}\" is declared twice"
                )));
            }
        }

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                version,
                location,
                tables: registered,
                engine: Mutex::new(None),
                registry: SubscriptionRegistry::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.inner.tables.values()
    }

    pub fn is_open(&self) -> bool {
        self.engine_slot().is_some()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Open (or create) the engine connection, creating an object store for
    /// every declared table that does not exist yet, keyed by the table's
    /// primary-key column. Re-opening an already-open handle is a no-op.
    pub async fn open(&self) -> Result<()> {
        let mut slot = self
            .inner
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let specs: Vec<StoreSpec> = self
            .inner
            .tables
            .values()
            .map(|table| StoreSpec {
                name: table.name().to_string(),
                key_path: table.key().to_string(),
            })
            .collect();

        let engine = match &self.inner.location {
            Location::OnDisk(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}.db", self.inner.name));
                Engine::open(&path, self.inner.version, &specs)?
            }
            Location::InMemory => Engine::open_in_memory(self.inner.version, &specs)?,
        };

        *slot = Some(Arc::new(engine));
        log::debug!(
            "opened database \"{}\" at version {}",
            self.inner.name,
            self.inner.version
        );
        Ok(())
    }

    /// Release the connection. Every data operation fails with `NotOpened`
    /// until `open` succeeds again.
    pub fn close(&self) {
        let released = self
            .inner
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            log::debug!("closed database \"{}\"", self.inner.name);
        }
    }

    // ── Data operations ──────────────────────────────────────────

    pub fn select(&self) -> Select {
        Select::new(self.clone())
    }

    pub fn insert(&self, table: &Table) -> Insert {
        Insert::new(self.clone(), table.clone())
    }

    pub fn update(&self, table: &Table) -> Update {
        Update::new(self.clone(), table.clone())
    }

    pub fn delete(&self, table: &Table) -> Delete {
        Delete::new(self.clone(), table.clone())
    }

    /// Run `callback` inside one engine transaction spanning `tables`.
    ///
    /// Every name is validated against the schema before anything opens: an
    /// unregistered name rejects immediately, naming the table, and the
    /// callback never runs. Operations issued through the context reuse the
    /// open transaction, so the callback is atomic: any error rolls every
    /// write back. Affected tables are notified once each, after commit.
    pub async fn transaction<R, F>(
        &self,
        tables: &[&str],
        mode: TransactionMode,
        callback: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut TransactionContext<'_, '_>) -> Result<R> + Send,
    {
        let engine = self.engine()?;
        for name in tables {
            if !self.inner.tables.contains_key(*name) {
                return Err(VitrineError::UnregisteredTable(name.to_string()));
            }
        }

        let scope: Vec<String> = tables.iter().map(|name| name.to_string()).collect();
        let mut touched = Vec::new();
        let result = engine
            .with_transaction(&scope, mode, |tx| {
                let mut context = TransactionContext {
                    db: self,
                    tx,
                    touched: Vec::new(),
                };
                let value = callback(&mut context)?;
                touched = context.touched;
                Ok(value)
            })
            .await?;

        for name in &touched {
            self.inner.registry.notify(name);
        }
        Ok(result)
    }

    // ── Internal access ──────────────────────────────────────────

    pub(crate) fn engine(&self) -> Result<Arc<Engine>> {
        self.engine_slot().ok_or(VitrineError::NotOpened)
    }

    pub(crate) fn ensure_registered(&self, table: &str) -> Result<()> {
        if self.inner.tables.contains_key(table) {
            Ok(())
        } else {
            Err(VitrineError::UnregisteredTable(table.to_string()))
        }
    }

    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    fn engine_slot(&self) -> Option<Arc<Engine>> {
        self.inner
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Operations scoped to one open transaction.
///
/// Handed to the `transaction` callback; reads and writes go through the
/// already-open engine transaction rather than opening their own. Touching
/// a store the transaction was not declared over fails without reaching
/// the engine.
pub struct TransactionContext<'a, 't> {
    db: &'a Database,
    tx: &'a EngineTx<'t>,
    touched: Vec<String>,
}

impl TransactionContext<'_, '_> {
    /// Query a table inside the transaction. Takes the same point-lookup
    /// fast path as `execute` when the predicate is a key equality.
    pub fn select(&self, table: &Table, predicate: Option<&Predicate>) -> Result<Vec<Row>> {
        self.db.ensure_registered(table.name())?;
        ops::select_rows(self.tx, table, predicate)
    }

    pub fn insert(&mut self, table: &Table, row: Row) -> Result<()> {
        self.db.ensure_registered(table.name())?;
        ops::insert_row(self.tx, table, &row)?;
        self.touch(table.name());
        Ok(())
    }

    /// Returns the number of rows changed.
    pub fn update(&mut self, table: &Table, values: Row, predicate: &Predicate) -> Result<usize> {
        self.db.ensure_registered(table.name())?;
        let touched = ops::update_rows(self.tx, table, &values, predicate)?;
        if touched > 0 {
            self.touch(table.name());
        }
        Ok(touched)
    }

    /// Returns the number of rows removed.
    pub fn delete(&mut self, table: &Table, predicate: &Predicate) -> Result<usize> {
        self.db.ensure_registered(table.name())?;
        let touched = ops::delete_rows(self.tx, table, predicate)?;
        if touched > 0 {
            self.touch(table.name());
        }
        Ok(touched)
    }

    fn touch(&mut self, table: &str) {
        if !self.touched.iter().any(|name| name == table) {
            self.touched.push(table.to_string());
        }
    }
}
