use crate::error::{Result, VitrineError};
use crate::key::Key;
use crate::schema::Row;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::VecDeque;
use std::path::Path;
use tokio::sync::Mutex;

/// Access mode for an engine transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Declaration of one object store: its name and the column used as key path.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub name: String,
    pub key_path: String,
}

/// The embedded object-store engine.
///
/// One SQLite table per store, rows keyed by the store's key path and
/// serialized as JSON. The connection lives behind an async mutex, so every
/// call suspends rather than blocking the caller; the engine serializes
/// transactions itself and this layer adds no locking beyond that.
pub struct Engine {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Open (or create) the engine database at `path`, creating any declared
    /// store that does not exist yet. Re-running against an existing,
    /// already-migrated database is a no-op.
    pub fn open(path: &Path, version: u32, stores: &[StoreSpec]) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn, version, stores)
    }

    /// Open an in-memory engine. Contents vanish when the engine is dropped.
    pub fn open_in_memory(version: u32, stores: &[StoreSpec]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, version, stores)
    }

    fn initialize(conn: Connection, version: u32, stores: &[StoreSpec]) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS _meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS _stores (
                name TEXT PRIMARY KEY,
                key_path TEXT NOT NULL
            );
            ",
        )?;

        let stored: Option<u32> = conn
            .query_row("SELECT version FROM _meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match stored {
            Some(current) if version < current => {
                return Err(VitrineError::VersionConflict {
                    requested: version,
                    current,
                });
            }
            Some(current) if version > current => {
                conn.execute("UPDATE _meta SET version = ?1 WHERE id = 1", params![version])?;
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO _meta (id, version) VALUES (1, ?1)",
                    params![version],
                )?;
            }
        }

        for spec in stores {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT key_path FROM _stores WHERE name = ?1",
                    params![spec.name],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(key_path) if key_path != spec.key_path => {
                    return Err(VitrineError::Schema(format!(
                        "store \"{}\" is keyed by \"{key_path}\", cannot re-key it to \"{}\"",
                        spec.name, spec.key_path
                    )));
                }
                Some(_) => {}
                None => {
                    conn.execute_batch(&format!(
                        "CREATE TABLE IF NOT EXISTS \"{}\" (\"key\" PRIMARY KEY NOT NULL, data TEXT NOT NULL)",
                        spec.name
                    ))?;
                    conn.execute(
                        "INSERT INTO _stores (name, key_path) VALUES (?1, ?2)",
                        params![spec.name, spec.key_path],
                    )?;
                    log::debug!(
                        "created object store \"{}\" keyed by \"{}\"",
                        spec.name,
                        spec.key_path
                    );
                }
            }
        }

        Ok(Engine {
            conn: Mutex::new(conn),
        })
    }

    /// Point lookup by key.
    pub async fn get(&self, store: &str, key: &Key) -> Result<Option<Row>> {
        let conn = self.conn.lock().await;
        fetch_one(&conn, store, key)
    }

    /// Every row of a store, in key order.
    pub async fn get_all(&self, store: &str) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        fetch_all(&conn, store)
    }

    /// Run `f` inside a single engine transaction spanning `stores`.
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub async fn with_transaction<R, F>(
        &self,
        stores: &[String],
        mode: TransactionMode,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&EngineTx<'_>) -> Result<R> + Send,
    {
        let mut conn = self.conn.lock().await;
        let behavior = match mode {
            TransactionMode::ReadOnly => TransactionBehavior::Deferred,
            TransactionMode::ReadWrite => TransactionBehavior::Immediate,
        };
        let tx = conn.transaction_with_behavior(behavior)?;
        let etx = EngineTx {
            tx,
            mode,
            scope: stores,
        };
        match f(&etx) {
            Ok(value) => {
                let EngineTx { tx, .. } = etx;
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let EngineTx { tx, .. } = etx;
                if let Err(rollback_err) = tx.rollback() {
                    log::warn!("transaction rollback failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }
}

/// An open engine transaction, scoped to the stores it was declared over.
/// Touching any other store fails without reaching the engine.
pub struct EngineTx<'a> {
    tx: rusqlite::Transaction<'a>,
    mode: TransactionMode,
    scope: &'a [String],
}

impl<'a> EngineTx<'a> {
    pub fn get(&self, store: &str, key: &Key) -> Result<Option<Row>> {
        self.check_scope(store)?;
        fetch_one(&self.tx, store, key)
    }

    pub fn get_all(&self, store: &str) -> Result<Vec<Row>> {
        self.check_scope(store)?;
        fetch_all(&self.tx, store)
    }

    /// Insert a new row under `key`. Fails if the key is already present.
    pub fn add(&self, store: &str, key: &Key, row: &Row) -> Result<()> {
        self.check_scope(store)?;
        self.check_writable()?;
        let data = serde_json::to_string(row)?;
        let sql = format!("INSERT INTO \"{store}\" (\"key\", data) VALUES (?1, ?2)");
        match self.tx.execute(&sql, params![key, data]) {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(VitrineError::DuplicateKey {
                store: store.to_string(),
                key: key.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Open a forward cursor over a snapshot of the store, in key order.
    pub fn open_cursor(&self, store: &str) -> Result<Cursor<'_>> {
        self.check_scope(store)?;
        let entries = fetch_entries(&self.tx, store)?;
        Ok(Cursor {
            conn: &self.tx,
            mode: self.mode,
            store: store.to_string(),
            entries: entries.into(),
            current: None,
        })
    }

    fn check_scope(&self, store: &str) -> Result<()> {
        if self.scope.iter().any(|s| s == store) {
            Ok(())
        } else {
            Err(VitrineError::OutOfScope(store.to_string()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(VitrineError::ReadOnly),
        }
    }
}

/// A forward cursor over one store within an open transaction.
///
/// Iterates a snapshot taken when the cursor was opened; `update` and
/// `delete` act on the entry most recently returned by `advance`.
pub struct Cursor<'t> {
    conn: &'t Connection,
    mode: TransactionMode,
    store: String,
    entries: VecDeque<(Key, Row)>,
    current: Option<Key>,
}

impl<'t> Cursor<'t> {
    /// Step to the next entry, returning its key and row.
    pub fn advance(&mut self) -> Option<(Key, Row)> {
        let entry = self.entries.pop_front();
        self.current = entry.as_ref().map(|(key, _)| key.clone());
        entry
    }

    /// Replace the current entry's row in place.
    pub fn update(&self, row: &Row) -> Result<()> {
        self.check_writable()?;
        let key = self.current_key()?;
        let data = serde_json::to_string(row)?;
        let sql = format!("UPDATE \"{}\" SET data = ?2 WHERE \"key\" = ?1", self.store);
        self.conn.execute(&sql, params![key, data])?;
        Ok(())
    }

    /// Delete the current entry.
    pub fn delete(&self) -> Result<()> {
        self.check_writable()?;
        let key = self.current_key()?;
        let sql = format!("DELETE FROM \"{}\" WHERE \"key\" = ?1", self.store);
        self.conn.execute(&sql, params![key])?;
        Ok(())
    }

    fn current_key(&self) -> Result<&Key> {
        self.current
            .as_ref()
            .ok_or_else(|| VitrineError::Other("cursor has no current entry".to_string()))
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            TransactionMode::ReadWrite => Ok(()),
            TransactionMode::ReadOnly => Err(VitrineError::ReadOnly),
        }
    }
}

// ── Shared row access ────────────────────────────────────────────

fn fetch_one(conn: &Connection, store: &str, key: &Key) -> Result<Option<Row>> {
    let sql = format!("SELECT data FROM \"{store}\" WHERE \"key\" = ?1");
    let data: Option<String> = conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?;
    data.as_deref().map(parse_row).transpose()
}

fn fetch_all(conn: &Connection, store: &str) -> Result<Vec<Row>> {
    let sql = format!("SELECT data FROM \"{store}\" ORDER BY \"key\"");
    let mut stmt = conn.prepare(&sql)?;
    let datas = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    datas.iter().map(|data| parse_row(data)).collect()
}

fn fetch_entries(conn: &Connection, store: &str) -> Result<Vec<(Key, Row)>> {
    let sql = format!("SELECT \"key\", data FROM \"{store}\" ORDER BY \"key\"");
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map([], |row| {
            Ok((row.get::<_, Key>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter()
        .map(|(key, data)| Ok((key, parse_row(&data)?)))
        .collect()
}

fn parse_row(data: &str) -> Result<Row> {
    match serde_json::from_str(data)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(VitrineError::Other(
            "stored row is not a JSON object".to_string(),
        )),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
