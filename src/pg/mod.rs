//! # PostgreSQL Module
//!
//! The convergence side of the reconciler: the statement-execution
//! capability, the connection manager behind it, and one reconciler per
//! object category (roles, databases with extensions, replication slots).
//!
//! Every reconciler issues its statements through [`SqlExecutor`], so tests
//! can count exactly which statements a convergence step produces. User
//! input never reaches SQL text except as a bound parameter, an
//! [`identifier`], or a [`literal`].

use async_trait::async_trait;

use crate::error::Result;

pub mod conn;
pub mod database;
pub mod extension;
pub mod role;
pub mod slot;

pub use conn::ConnectionManager;
pub use database::DatabaseReconciler;
pub use role::{Role, RoleOption, RoleReconciler};
pub use slot::SlotReconciler;

/// Parameterized statement execution against the cluster.
///
/// `db` addresses the connection: `None` is the administrative connection,
/// `Some(name)` a connection scoped to that database. Implementations own
/// connection lifecycle; callers only see statements.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement, discarding any result rows.
    async fn execute(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<()>;

    /// Run a query and report whether it returned at least one row.
    async fn exists(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<bool>;

    /// Run a query returning the first field of the first row, if any.
    async fn one_field(&self, db: Option<&str>, sql: &str, params: &[&str])
        -> Result<Option<String>>;

    /// Run a query returning every row as a list of text fields.
    async fn rows(&self, db: Option<&str>, sql: &str, params: &[&str]) -> Result<Vec<Vec<String>>>;
}

/// Quote a SQL identifier: embedded double quotes are doubled.
pub fn identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal: embedded single quotes are doubled.
pub fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
