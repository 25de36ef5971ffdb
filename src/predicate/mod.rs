use crate::key::Key;
use crate::schema::{Column, Row};
use std::fmt;
use std::sync::Arc;

/// A boolean row filter.
///
/// `KeyEq` is produced only by [`eq`] and carries the column and value it
/// compares, so the query executor can recognize an unmodified key-equality
/// test and take the point-lookup path. Everything else, including anything
/// built by [`and`] or [`or`], is an opaque `Custom` closure and always
/// scans.
#[derive(Clone)]
pub enum Predicate {
    Custom(Arc<dyn Fn(&Row) -> bool + Send + Sync>),
    KeyEq { column: String, value: Key },
}

impl Predicate {
    /// Wrap an arbitrary row closure.
    pub fn custom<F>(f: F) -> Predicate
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    /// Evaluate against a row. `KeyEq` compares the named column's value;
    /// a missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Custom(f) => f(row),
            Predicate::KeyEq { column, value } => {
                row.get(column).is_some_and(|v| *v == value.to_value())
            }
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Custom(_) => f.write_str("Custom(..)"),
            Predicate::KeyEq { column, value } => f
                .debug_struct("KeyEq")
                .field("column", column)
                .field("value", value)
                .finish(),
        }
    }
}

/// Equality test on a column. The result is tagged with the column and
/// value; when the column is the table's primary key, `execute` resolves it
/// with a direct point lookup instead of a scan.
pub fn eq<T, V>(column: &Column<T>, value: V) -> Predicate
where
    T: Into<Key>,
    V: Into<T>,
{
    let value: T = value.into();
    Predicate::KeyEq {
        column: column.name().to_string(),
        value: value.into(),
    }
}

/// True iff every predicate is true. Short-circuits left to right; an empty
/// set is true. The result is always `Custom`, even over `KeyEq` inputs.
pub fn and<I>(predicates: I) -> Predicate
where
    I: IntoIterator<Item = Predicate>,
{
    let predicates: Vec<Predicate> = predicates.into_iter().collect();
    Predicate::custom(move |row| predicates.iter().all(|p| p.matches(row)))
}

/// True iff any predicate is true. Short-circuits left to right; an empty
/// set is false. The result is always `Custom`.
pub fn or<I>(predicates: I) -> Predicate
where
    I: IntoIterator<Item = Predicate>,
{
    let predicates: Vec<Predicate> = predicates.into_iter().collect();
    Predicate::custom(move |row| predicates.iter().any(|p| p.matches(row)))
}
