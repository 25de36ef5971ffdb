pub mod database;
pub mod engine;
pub mod error;
pub mod key;
pub mod ops;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod schema;

pub use database::{Database, TransactionContext};
pub use engine::{Engine, StoreSpec, TransactionMode};
pub use error::{Result, VitrineError};
pub use key::Key;
pub use ops::{Delete, Insert, Update, UpdateSet};
pub use predicate::{and, eq, or, Predicate};
pub use query::{QueryBuilder, Select};
pub use registry::{Subscription, SubscriptionRegistry};
pub use schema::{column, table, Column, Row, Table};
