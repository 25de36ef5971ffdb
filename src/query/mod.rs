use crate::database::Database;
use crate::error::Result;
use crate::predicate::Predicate;
use crate::registry::{Listener, Subscription};
use crate::schema::{Row, Table};
use std::sync::Arc;

/// Entry point of the fluent query chain; binds a table via `from`.
pub struct Select {
    db: Database,
}

impl Select {
    pub(crate) fn new(db: Database) -> Self {
        Select { db }
    }

    pub fn from(self, table: &Table) -> QueryBuilder {
        QueryBuilder {
            db: self.db,
            table: table.clone(),
            predicate: None,
        }
    }
}

/// An immutable query descriptor: one table, at most one predicate.
/// Built incrementally, executed by `execute` or subscribed via `live`.
#[derive(Clone)]
pub struct QueryBuilder {
    db: Database,
    table: Table,
    predicate: Option<Predicate>,
}

impl QueryBuilder {
    /// Record the predicate. A second call replaces the first; predicates
    /// that should compose must be combined with `and`/`or` before this.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Run the query.
    ///
    /// A predicate produced directly by `eq` on the table's primary-key
    /// column resolves as a point lookup; everything else retrieves all rows
    /// and filters them here, without any secondary index.
    pub async fn execute(&self) -> Result<Vec<Row>> {
        execute_query(&self.db, &self.table, self.predicate.as_ref()).await
    }

    /// Execute now, deliver the rows to `callback`, then re-execute and
    /// re-deliver after every committed mutation of the bound table.
    ///
    /// Re-execution is a full re-run of the same query, not an incremental
    /// diff. A re-run that was already triggered when `unsubscribe` is
    /// called may deliver one final time, so callbacks must be idempotent.
    pub async fn live<F>(self, callback: F) -> Result<Subscription>
    where
        F: Fn(Vec<Row>) + Send + Sync + 'static,
    {
        let QueryBuilder {
            db,
            table,
            predicate,
        } = self;

        let rows = execute_query(&db, &table, predicate.as_ref()).await?;
        callback(rows);

        let callback = Arc::new(callback);
        let table_name = table.name().to_string();
        let listener: Listener = {
            let db = db.clone();
            Arc::new(move || {
                let db = db.clone();
                let table = table.clone();
                let predicate = predicate.clone();
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    match execute_query(&db, &table, predicate.as_ref()).await {
                        Ok(rows) => callback(rows),
                        Err(err) => {
                            log::warn!("live query on \"{}\" failed to re-run: {err}", table.name());
                        }
                    }
                });
            })
        };

        Ok(db.registry().subscribe(&table_name, listener))
    }
}

pub(crate) async fn execute_query(
    db: &Database,
    table: &Table,
    predicate: Option<&Predicate>,
) -> Result<Vec<Row>> {
    let engine = db.engine()?;
    db.ensure_registered(table.name())?;

    if let Some(Predicate::KeyEq { column, value }) = predicate {
        if column == table.key() {
            log::debug!("point lookup on \"{}\" by key {value}", table.name());
            return Ok(engine.get(table.name(), value).await?.into_iter().collect());
        }
    }

    let rows = engine.get_all(table.name()).await?;
    Ok(match predicate {
        Some(p) => rows.into_iter().filter(|row| p.matches(row)).collect(),
        None => rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::VitrineError;
    use crate::predicate::{and, eq, or};
    use crate::schema::{column, table, Column};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn users() -> Table {
        table("users", &["id", "name", "age"], "id").unwrap()
    }

    fn id() -> Column<i64> {
        column("id")
    }

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn open_db() -> Database {
        let db = Database::in_memory("people", 1, [users()]).unwrap();
        db.open().await.unwrap();
        db
    }

    async fn seed(db: &Database) {
        for value in [
            json!({"id": 1, "name": "John", "age": 30}),
            json!({"id": 2, "name": "Alice", "age": 25}),
            json!({"id": 3, "name": "Bob", "age": 30}),
        ] {
            db.insert(&users()).values(row(value)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn select_without_predicate_returns_every_row() {
        let db = open_db().await;
        seed(&db).await;

        let rows = db.select().from(&users()).execute().await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn key_equality_resolves_by_point_lookup() {
        let db = open_db().await;
        seed(&db).await;

        let rows = db
            .select()
            .from(&users())
            .filter(eq(&id(), 2))
            .execute()
            .await
            .unwrap();
        assert_eq!(rows, vec![row(json!({"id": 2, "name": "Alice", "age": 25}))]);

        let missing = db
            .select()
            .from(&users())
            .filter(eq(&id(), 99))
            .execute()
            .await
            .unwrap();
        assert_eq!(missing, Vec::<Row>::new());
    }

    #[tokio::test]
    async fn fast_path_agrees_with_a_filtered_scan() {
        let db = open_db().await;
        seed(&db).await;

        for key in [1i64, 2, 3, 42] {
            let point = db
                .select()
                .from(&users())
                .filter(eq(&id(), key))
                .execute()
                .await
                .unwrap();
            let scan = db
                .select()
                .from(&users())
                .filter(Predicate::custom(move |r: &Row| r["id"] == json!(key)))
                .execute()
                .await
                .unwrap();
            assert_eq!(point, scan);
        }
    }

    #[tokio::test]
    async fn eq_on_a_non_key_column_scans() {
        let db = open_db().await;
        seed(&db).await;

        let age = column::<i64>("age");
        let rows = db
            .select()
            .from(&users())
            .filter(eq(&age, 30))
            .execute()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn combined_predicates_scan_and_filter() {
        let db = open_db().await;
        seed(&db).await;

        let rows = db
            .select()
            .from(&users())
            .filter(and([
                Predicate::custom(|r: &Row| r["age"] == json!(30)),
                Predicate::custom(|r: &Row| r["name"] == json!("Bob")),
            ]))
            .execute()
            .await
            .unwrap();
        assert_eq!(rows, vec![row(json!({"id": 3, "name": "Bob", "age": 30}))]);

        let rows = db
            .select()
            .from(&users())
            .filter(or([
                Predicate::custom(|r: &Row| r["name"] == json!("Tom")),
                Predicate::custom(|r: &Row| r["name"] == json!("Alice")),
            ]))
            .execute()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn a_second_filter_call_replaces_the_first() {
        let db = open_db().await;
        seed(&db).await;

        let rows = db
            .select()
            .from(&users())
            .filter(eq(&id(), 1))
            .filter(Predicate::custom(|r: &Row| r["age"] == json!(30)))
            .execute()
            .await
            .unwrap();
        // Only the age filter applies; the id filter was overwritten.
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn execute_requires_an_open_database() {
        let db = Database::in_memory("people", 1, [users()]).unwrap();
        let err = db.select().from(&users()).execute().await.unwrap_err();
        assert!(matches!(err, VitrineError::NotOpened));
    }

    #[tokio::test]
    async fn execute_rejects_unregistered_tables() {
        let db = open_db().await;
        let orders = table("orders", &["id"], "id").unwrap();
        let err = db.select().from(&orders).execute().await.unwrap_err();
        assert!(matches!(err, VitrineError::UnregisteredTable(name) if name == "orders"));
    }

    #[tokio::test]
    async fn live_delivers_immediately_and_after_each_mutation() {
        let db = open_db().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = db
            .select()
            .from(&users())
            .live(move |rows| {
                let _ = tx.send(rows);
            })
            .await
            .unwrap();

        let initial = rx.recv().await.unwrap();
        assert!(initial.is_empty());

        db.insert(&users())
            .values(row(json!({"id": 1, "name": "John", "age": 30})))
            .await
            .unwrap();
        let after_insert = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_insert.len(), 1);

        db.update(&users())
            .set(row(json!({"name": "J"})))
            .filter(eq(&id(), 1))
            .await
            .unwrap();
        let after_update = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_update[0]["name"], json!("J"));

        db.delete(&users()).filter(eq(&id(), 1)).await.unwrap();
        let after_delete = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(after_delete.is_empty());

        subscription.unsubscribe();
        db.insert(&users())
            .values(row(json!({"id": 2, "name": "Alice", "age": 25})))
            .await
            .unwrap();
        // Unsubscribing dropped the only sender, so a drained channel closes
        // instead of delivering anything further.
        let after_unsubscribe = timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap();
        assert!(after_unsubscribe.is_none());
    }

    #[tokio::test]
    async fn live_queries_keep_their_predicate() {
        let db = open_db().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = db
            .select()
            .from(&users())
            .filter(eq(&id(), 1))
            .live(move |rows| {
                let _ = tx.send(rows);
            })
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().is_empty());

        // A non-matching row still triggers a re-run of the same query.
        db.insert(&users())
            .values(row(json!({"id": 2, "name": "Alice", "age": 25})))
            .await
            .unwrap();
        let rerun = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(rerun.is_empty());

        db.insert(&users())
            .values(row(json!({"id": 1, "name": "John", "age": 30})))
            .await
            .unwrap();
        let rerun = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rerun, vec![row(json!({"id": 1, "name": "John", "age": 30}))]);

        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn live_fails_up_front_when_not_opened() {
        let db = Database::in_memory("people", 1, [users()]).unwrap();
        let result = db.select().from(&users()).live(|_| {}).await;
        assert!(matches!(result, Err(VitrineError::NotOpened)));
        assert_eq!(db.registry().listener_count("users"), 0);
    }
}
