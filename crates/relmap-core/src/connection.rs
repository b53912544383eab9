//! Connection contracts consumed by the unit of work.
//!
//! - [`Connection`] - a transactional connection with auto-commit disabled
//! - [`ConnectionProvider`] - yields one such connection per unit of work
//! - [`TransactionConfig`] - isolation settings passed to the provider
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Dirty reads, non-repeatable reads and phantoms possible.
    ReadUncommitted,

    /// Only committed changes from other transactions are visible.
    #[default]
    ReadCommitted,

    /// A consistent snapshot for the lifetime of the transaction.
    RepeatableRead,

    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Settings a provider applies to the connection it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionConfig {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The `SET TRANSACTION` statement a SQL driver would issue.
    pub fn to_sql(&self) -> String {
        let mode = if self.read_only {
            "READ ONLY"
        } else {
            "READ WRITE"
        };
        format!(
            "SET TRANSACTION ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            mode
        )
    }
}

/// Result of a mutation statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Values of database-generated key columns, in key order. Empty when
    /// the statement generated nothing.
    pub generated_keys: Vec<Value>,
}

impl ExecResult {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_keys: Vec::new(),
        }
    }
}

/// A database connection owned by one unit of work.
///
/// Auto-commit is disabled: every statement runs inside the connection's
/// open transaction until [`commit`](Connection::commit) or
/// [`rollback`](Connection::rollback).
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT \"id\" FROM \"heroes\" WHERE \"id\" = $1", &[Value::BigInt(1)]).await;
/// conn.execute(&cx, "DELETE FROM \"heroes\" WHERE \"id\" = $1", &[Value::BigInt(1)]).await;
/// conn.commit(&cx).await;
/// ```
pub trait Connection: Send + Sync + 'static {
    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute an INSERT, UPDATE or DELETE.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<ExecResult, crate::Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Close the connection.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}

/// Source of transactional connections, one per unit of work.
pub trait ConnectionProvider: Send + Sync + 'static {
    type Conn: Connection;

    /// Open a new connection with auto-commit disabled and `config` applied.
    fn connect(
        &self,
        cx: &Cx,
        config: &TransactionConfig,
    ) -> impl Future<Output = Outcome<Self::Conn, crate::Error>> + Send;
}
