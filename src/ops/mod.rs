use crate::database::Database;
use crate::engine::{EngineTx, TransactionMode};
use crate::error::{Result, VitrineError};
use crate::predicate::Predicate;
use crate::schema::{Row, Table};

/// Single-row insert, executed by `values`.
pub struct Insert {
    db: Database,
    table: Table,
}

impl Insert {
    pub(crate) fn new(db: Database, table: Table) -> Self {
        Insert { db, table }
    }

    /// Add `row` to the table. The row must supply every declared column and
    /// a fresh primary key; an existing key fails with `DuplicateKey`.
    pub async fn values(self, row: Row) -> Result<()> {
        let engine = self.db.engine()?;
        self.db.ensure_registered(self.table.name())?;

        let scope = [self.table.name().to_string()];
        engine
            .with_transaction(&scope, TransactionMode::ReadWrite, |tx| {
                insert_row(tx, &self.table, &row)
            })
            .await?;

        self.db.registry().notify(self.table.name());
        Ok(())
    }
}

/// Multi-row update; `set` records the patch, `filter` executes.
pub struct Update {
    db: Database,
    table: Table,
}

impl Update {
    pub(crate) fn new(db: Database, table: Table) -> Self {
        Update { db, table }
    }

    pub fn set(self, values: Row) -> UpdateSet {
        UpdateSet {
            db: self.db,
            table: self.table,
            values,
        }
    }
}

pub struct UpdateSet {
    db: Database,
    table: Table,
    values: Row,
}

impl UpdateSet {
    /// Merge the patch into every row the predicate matches, in place.
    /// The predicate sees each row's stored state, before any merge from
    /// this same operation; non-matching rows are left untouched.
    pub async fn filter(self, predicate: Predicate) -> Result<()> {
        let engine = self.db.engine()?;
        self.db.ensure_registered(self.table.name())?;

        let scope = [self.table.name().to_string()];
        let touched = engine
            .with_transaction(&scope, TransactionMode::ReadWrite, |tx| {
                update_rows(tx, &self.table, &self.values, &predicate)
            })
            .await?;

        log::debug!("updated {touched} row(s) in \"{}\"", self.table.name());
        self.db.registry().notify(self.table.name());
        Ok(())
    }
}

/// Multi-row delete, executed by `filter`.
pub struct Delete {
    db: Database,
    table: Table,
}

impl Delete {
    pub(crate) fn new(db: Database, table: Table) -> Self {
        Delete { db, table }
    }

    /// Remove every row the predicate matches.
    pub async fn filter(self, predicate: Predicate) -> Result<()> {
        let engine = self.db.engine()?;
        self.db.ensure_registered(self.table.name())?;

        let scope = [self.table.name().to_string()];
        let touched = engine
            .with_transaction(&scope, TransactionMode::ReadWrite, |tx| {
                delete_rows(tx, &self.table, &predicate)
            })
            .await?;

        log::debug!("deleted {touched} row(s) from \"{}\"", self.table.name());
        self.db.registry().notify(self.table.name());
        Ok(())
    }
}

// ── Transactional kernels ────────────────────────────────────────
// Shared between the standalone builders above and TransactionContext,
// so both paths behave identically inside an engine transaction.

pub(crate) fn insert_row(tx: &EngineTx<'_>, table: &Table, row: &Row) -> Result<()> {
    let key = table.validate_row(row)?;
    tx.add(table.name(), &key, row)
}

pub(crate) fn update_rows(
    tx: &EngineTx<'_>,
    table: &Table,
    values: &Row,
    predicate: &Predicate,
) -> Result<usize> {
    let mut cursor = tx.open_cursor(table.name())?;
    let mut touched = 0;
    while let Some((key, row)) = cursor.advance() {
        if !predicate.matches(&row) {
            continue;
        }
        let merged = merge_partial(&row, values);
        if table.key_of(&merged)? != key {
            return Err(VitrineError::InvalidRow(format!(
                "update would change the primary key of a row in \"{}\"",
                table.name()
            )));
        }
        cursor.update(&merged)?;
        touched += 1;
    }
    Ok(touched)
}

pub(crate) fn delete_rows(tx: &EngineTx<'_>, table: &Table, predicate: &Predicate) -> Result<usize> {
    let mut cursor = tx.open_cursor(table.name())?;
    let mut touched = 0;
    while let Some((_, row)) = cursor.advance() {
        if predicate.matches(&row) {
            cursor.delete()?;
            touched += 1;
        }
    }
    Ok(touched)
}

pub(crate) fn select_rows(
    tx: &EngineTx<'_>,
    table: &Table,
    predicate: Option<&Predicate>,
) -> Result<Vec<Row>> {
    if let Some(Predicate::KeyEq { column, value }) = predicate {
        if column == table.key() {
            return Ok(tx.get(table.name(), value)?.into_iter().collect());
        }
    }
    let rows = tx.get_all(table.name())?;
    Ok(match predicate {
        Some(p) => rows.into_iter().filter(|row| p.matches(row)).collect(),
        None => rows,
    })
}

fn merge_partial(base: &Row, patch: &Row) -> Row {
    let mut merged = base.clone();
    for (field, value) in patch {
        merged.insert(field.clone(), value.clone());
    }
    merged
}
