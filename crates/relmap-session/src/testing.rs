//! Scripted connection and sample entity shared by the session unit tests.

use asupersync::CancelReason;
use relmap_core::{
    Connection, ConnectionProvider, Cx, Entity, EntityDescriptor, Error, ExecResult, KeyField,
    Outcome, QueryError, QueryErrorKind, Result, Row, RowContext, TransactionConfig, Value,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Hero {
    pub id: Option<i64>,
    pub name: String,
    pub version: i64,
}

impl Hero {
    pub fn stored(id: i64, name: &str, version: i64) -> Self {
        Self {
            id: Some(id),
            name: name.to_string(),
            version,
        }
    }

    pub fn unsaved(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            version: 0,
        }
    }
}

impl Entity for Hero {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("heroes")
            .key(KeyField::new("id").generated())
            .column("name")
            .version("version")
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &RowContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            version: row.get("version")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn set_generated_keys(&mut self, keys: &[Value]) {
        self.id = keys.first().and_then(Value::as_i64);
    }
}

pub(crate) fn hero_row(id: i64, name: &str, version: i64) -> Row {
    Row::new(
        vec!["id".into(), "name".into(), "version".into()],
        vec![Value::BigInt(id), Value::Text(name.into()), Value::BigInt(version)],
    )
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub statements: Vec<String>,
    pub rows: Vec<Row>,
    /// Affected-row counts for upcoming executes; 1 once exhausted.
    pub affected: VecDeque<u64>,
    pub next_key: i64,
    pub fail_execute: bool,
    pub fail_rollback: bool,
    pub fail_close: bool,
    /// Executes starting with this prefix report cancellation.
    pub cancel_on: Option<&'static str>,
    pub connects: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
}

fn mock_failure(message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: None,
        sqlstate: None,
        message: message.to_string(),
        source: None,
    })
}

/// Records every statement; answers with scripted results.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        let conn = Self::default();
        conn.state().next_key = 100;
        conn
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    pub fn script_affected(&self, counts: impl IntoIterator<Item = u64>) {
        self.state().affected.extend(counts);
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }
}

impl Connection for MockConnection {
    async fn query(&self, _cx: &Cx, sql: &str, _params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let mut state = self.state();
        state.statements.push(sql.to_string());
        Outcome::Ok(state.rows.clone())
    }

    async fn execute(&self, _cx: &Cx, sql: &str, _params: &[Value]) -> Outcome<ExecResult, Error> {
        let mut state = self.state();
        state.statements.push(sql.to_string());
        if state.fail_execute {
            return Outcome::Err(mock_failure("scripted execute failure"));
        }
        if state.cancel_on.is_some_and(|prefix| sql.starts_with(prefix)) {
            return Outcome::Cancelled(CancelReason::user("scripted execute cancellation"));
        }
        let rows_affected = state.affected.pop_front().unwrap_or(1);
        let mut result = ExecResult::affected(rows_affected);
        if sql.starts_with("INSERT") && !sql.contains("(\"id\"") {
            result.generated_keys.push(Value::BigInt(state.next_key));
            state.next_key += 1;
        }
        Outcome::Ok(result)
    }

    async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.state().commits += 1;
        Outcome::Ok(())
    }

    async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
        let mut state = self.state();
        state.rollbacks += 1;
        if state.fail_rollback {
            return Outcome::Err(mock_failure("scripted rollback failure"));
        }
        Outcome::Ok(())
    }

    async fn close(self, _cx: &Cx) -> Result<()> {
        let mut state = self.state();
        state.closes += 1;
        if state.fail_close {
            return Err(mock_failure("scripted close failure"));
        }
        Ok(())
    }
}

/// Hands out clones of one shared mock connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockProvider {
    pub conn: MockConnection,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            conn: MockConnection::new(),
        }
    }
}

impl ConnectionProvider for MockProvider {
    type Conn = MockConnection;

    async fn connect(&self, _cx: &Cx, _config: &TransactionConfig) -> Outcome<MockConnection, Error> {
        self.conn.state().connects += 1;
        Outcome::Ok(self.conn.clone())
    }
}

pub(crate) fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}
