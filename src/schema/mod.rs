use crate::error::{Result, VitrineError};
use crate::key::Key;
use std::fmt;
use std::marker::PhantomData;

/// A row as stored: a mapping from column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A typed column descriptor. Pure metadata; identity is the name.
/// The type parameter only types the `eq` predicate helper.
pub struct Column<T> {
    name: String,
    _value: PhantomData<T>,
}

impl<T> Column<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Column<T> {
    fn clone(&self) -> Self {
        Column {
            name: self.name.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Column<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column").field("name", &self.name).finish()
    }
}

/// Declare a column. Construction never touches storage.
pub fn column<T>(name: &str) -> Column<T> {
    Column {
        name: name.to_string(),
        _value: PhantomData,
    }
}

/// A table descriptor: name, declared columns, and the primary-key column.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    key: String,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary-key column, also the store's key path.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Check that a row supplies every declared column, then extract its
    /// primary key. Undeclared extra fields are allowed and carried through.
    pub fn validate_row(&self, row: &Row) -> Result<Key> {
        for column in &self.columns {
            if !row.contains_key(column) {
                return Err(VitrineError::InvalidRow(format!(
                    "row for table \"{}\" is missing declared column \"{column}\"",
                    self.name
                )));
            }
        }
        self.key_of(row)
    }

    /// Extract the primary key of a row.
    pub fn key_of(&self, row: &Row) -> Result<Key> {
        let value = row.get(&self.key).ok_or_else(|| {
            VitrineError::InvalidRow(format!(
                "row for table \"{}\" has no primary key column \"{}\"",
                self.name, self.key
            ))
        })?;
        Key::from_value(value).ok_or_else(|| {
            VitrineError::InvalidRow(format!(
                "primary key column \"{}\" of table \"{}\" must hold an integer or a string",
                self.key, self.name
            ))
        })
    }
}

/// Declare a table. Fails fast if the key column is not one of `columns`,
/// or if any name is not usable as a store identifier.
pub fn table(name: &str, columns: &[&str], key: &str) -> Result<Table> {
    if !is_identifier(name) {
        return Err(VitrineError::Schema(format!(
            "table name \"{name}\" is not a valid identifier"
        )));
    }
    if name.starts_with('_') {
        // Leading-underscore store names are reserved for engine bookkeeping.
        return Err(VitrineError::Schema(format!(
            "table name \"{name}\" is reserved"
        )));
    }

    let mut seen: Vec<&str> = Vec::with_capacity(columns.len());
    for column in columns {
        if !is_identifier(column) {
            return Err(VitrineError::Schema(format!(
                "column name \"{column}\" in table \"{name}\" is not a valid identifier"
            )));
        }
        if seen.contains(column) {
            return Err(VitrineError::Schema(format!(
                "column \"{column}\" is declared twice in table \"{name}\""
            )));
        }
        seen.push(column);
    }

    if !seen.contains(&key) {
        return Err(VitrineError::Schema(format!(
            "key column \"{key}\" is not declared in table \"{name}\""
        )));
    }

    Ok(Table {
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        key: key.to_string(),
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn users() -> Table {
        table("users", &["id", "name", "age"], "id").unwrap()
    }

    #[test]
    fn column_records_its_name() {
        let id = column::<i64>("id");
        assert_eq!(id.name(), "id");
    }

    #[test]
    fn table_records_metadata() {
        let users = users();
        assert_eq!(users.name(), "users");
        assert_eq!(users.key(), "id");
        assert_eq!(users.columns(), ["id", "name", "age"]);
        assert!(users.has_column("age"));
        assert!(!users.has_column("email"));
    }

    #[test]
    fn key_must_be_a_declared_column() {
        let err = table("users", &["id", "name"], "email").unwrap_err();
        assert!(matches!(err, VitrineError::Schema(_)));
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn rejects_invalid_and_reserved_names() {
        assert!(table("user table", &["id"], "id").is_err());
        assert!(table("", &["id"], "id").is_err());
        assert!(table("_meta", &["id"], "id").is_err());
        assert!(table("users", &["id", "first name"], "id").is_err());
    }

    #[test]
    fn rejects_duplicate_columns() {
        let err = table("users", &["id", "id"], "id").unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn validate_row_requires_every_declared_column() {
        let users = users();
        let row = json!({"id": 1, "name": "John"});
        let err = users
            .validate_row(row.as_object().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("age"));
    }

    #[test]
    fn validate_row_extracts_the_key() {
        let users = users();
        let row = json!({"id": 1, "name": "John", "age": 30});
        let key = users.validate_row(row.as_object().unwrap()).unwrap();
        assert_eq!(key, Key::Int(1));
    }

    #[test]
    fn validate_row_rejects_unkeyable_values() {
        let users = users();
        let row = json!({"id": [1], "name": "John", "age": 30});
        let err = users.validate_row(row.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, VitrineError::InvalidRow(_)));
    }

    #[test]
    fn extra_fields_are_allowed() {
        let users = users();
        let row = json!({"id": 1, "name": "John", "age": 30, "nickname": "J"});
        assert!(users.validate_row(row.as_object().unwrap()).is_ok());
    }
}
