//! In-memory transactional database and sample entities for the
//! end-to-end tests.
//!
//! The database understands exactly the SQL the mapper emits: single-table
//! or `JOIN .. USING` selects with `AND`-ed equality filters, plus
//! `INSERT`, `UPDATE` and `DELETE` with equality filters. Each connection
//! keeps its writes private until it commits.

#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use regex::Regex;
use relmap::prelude::*;
use relmap::{ExecResult, QueryError, QueryErrorKind, UsageErrorKind};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

// ============================================================================
// Storage
// ============================================================================

type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Table {
    keys: Vec<String>,
    auto_key: bool,
    rows: Vec<Record>,
}

type Tables = BTreeMap<String, Table>;

/// Counters for everything the unit of work asked of the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub connects: usize,
    pub queries: usize,
    pub executes: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
}

#[derive(Default)]
struct Inner {
    tables: Tables,
    next_id: i64,
    stats: Stats,
    statements: Vec<String>,
    fail_on: Vec<String>,
    gate: Option<Shared<oneshot::Receiver<()>>>,
}

#[derive(Debug, Clone)]
enum Write {
    Insert {
        table: String,
        record: Record,
    },
    Update {
        table: String,
        set: Vec<(String, Value)>,
        filter: Vec<(String, Value)>,
    },
    Delete {
        table: String,
        filter: Vec<(String, Value)>,
    },
}

fn db_error(kind: QueryErrorKind, sql: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: message.into(),
        source: None,
    })
}

fn matches(record: &Record, filter: &[(String, Value)]) -> bool {
    filter
        .iter()
        .all(|(column, value)| record.get(column).is_some_and(|v| v.key_eq(value)))
}

fn key_of(table: &Table, record: &Record) -> Vec<Value> {
    table
        .keys
        .iter()
        .map(|k| record.get(k).cloned().unwrap_or(Value::Null))
        .collect()
}

fn table_mut<'t>(tables: &'t mut Tables, name: &str, sql: &str) -> Result<&'t mut Table> {
    tables
        .get_mut(name)
        .ok_or_else(|| db_error(QueryErrorKind::NotFound, sql, format!("no such table: {name}")))
}

/// Apply one write, returning the affected row count.
fn apply(tables: &mut Tables, write: &Write, sql: &str) -> Result<u64> {
    match write {
        Write::Insert { table, record } => {
            let table = table_mut(tables, table, sql)?;
            let key = key_of(table, record);
            let schema: &Table = table;
            if schema
                .rows
                .iter()
                .any(|row| key_of(schema, row).iter().zip(&key).all(|(a, b)| a.key_eq(b)))
            {
                return Err(db_error(
                    QueryErrorKind::Constraint,
                    sql,
                    "UNIQUE constraint failed",
                ));
            }
            table.rows.push(record.clone());
            Ok(1)
        }
        Write::Update { table, set, filter } => {
            let table = table_mut(tables, table, sql)?;
            let mut affected = 0;
            for row in table.rows.iter_mut().filter(|row| matches(row, filter)) {
                for (column, value) in set {
                    row.insert(column.clone(), value.clone());
                }
                affected += 1;
            }
            Ok(affected)
        }
        Write::Delete { table, filter } => {
            let table = table_mut(tables, table, sql)?;
            let before = table.rows.len();
            table.rows.retain(|row| !matches(row, filter));
            Ok((before - table.rows.len()) as u64)
        }
    }
}

// ============================================================================
// SQL parsing
// ============================================================================

static SELECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^SELECT (?P<cols>.+?) FROM "(?P<table>[^"]+)"(?P<joins>(?: JOIN "[^"]+" USING \([^)]*\))*)(?: WHERE (?P<filter>.+))?$"#,
    )
    .expect("select regex")
});
static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"JOIN "([^"]+)" USING \(([^)]*)\)"#).expect("join regex"));
static INSERT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^INSERT INTO "([^"]+)" \((.*)\) VALUES \((.*)\)$"#).expect("insert regex")
});
static UPDATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^UPDATE "([^"]+)" SET (.+) WHERE (.+)$"#).expect("update regex")
});
static DELETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^DELETE FROM "([^"]+)" WHERE (.+)$"#).expect("delete regex"));
static ASSIGN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"([^"]+)" = \$(\d+)$"#).expect("assignment regex"));

fn idents(list: &str) -> Vec<String> {
    list.split(", ")
        .map(|c| c.trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn param(params: &[Value], placeholder: &str, sql: &str) -> Result<Value> {
    let index: usize = placeholder
        .trim_start_matches('$')
        .parse()
        .map_err(|_| db_error(QueryErrorKind::Syntax, sql, "bad placeholder"))?;
    params
        .get(index - 1)
        .cloned()
        .ok_or_else(|| db_error(QueryErrorKind::Syntax, sql, "missing parameter"))
}

fn assignments(list: &str, separator: &str, params: &[Value], sql: &str) -> Result<Vec<(String, Value)>> {
    list.split(separator)
        .map(|part| {
            let caps = ASSIGN
                .captures(part)
                .ok_or_else(|| db_error(QueryErrorKind::Syntax, sql, format!("bad term: {part}")))?;
            Ok((caps[1].to_string(), param(params, &caps[2], sql)?))
        })
        .collect()
}

fn parse_write(sql: &str, params: &[Value]) -> Result<Write> {
    if let Some(caps) = INSERT.captures(sql) {
        let columns = idents(&caps[2]);
        let placeholders: Vec<&str> = caps[3].split(", ").collect();
        let mut record = Record::new();
        for (column, placeholder) in columns.into_iter().zip(placeholders) {
            record.insert(column, param(params, placeholder, sql)?);
        }
        return Ok(Write::Insert {
            table: caps[1].to_string(),
            record,
        });
    }
    if let Some(caps) = UPDATE.captures(sql) {
        return Ok(Write::Update {
            table: caps[1].to_string(),
            set: assignments(&caps[2], ", ", params, sql)?,
            filter: assignments(&caps[3], " AND ", params, sql)?,
        });
    }
    if let Some(caps) = DELETE.captures(sql) {
        return Ok(Write::Delete {
            table: caps[1].to_string(),
            filter: assignments(&caps[2], " AND ", params, sql)?,
        });
    }
    Err(db_error(QueryErrorKind::Syntax, sql, "unsupported statement"))
}

fn run_select(tables: &Tables, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let caps = SELECT
        .captures(sql)
        .ok_or_else(|| db_error(QueryErrorKind::Syntax, sql, "unsupported query"))?;
    let columns = idents(&caps["cols"]);
    let root = tables
        .get(&caps["table"])
        .ok_or_else(|| db_error(QueryErrorKind::NotFound, sql, "no such table"))?;
    let filter = match caps.name("filter") {
        Some(f) => assignments(f.as_str(), " AND ", params, sql)?,
        None => Vec::new(),
    };

    let mut joined: Vec<Record> = root.rows.clone();
    for join in JOIN.captures_iter(caps.name("joins").map_or("", |m| m.as_str())) {
        let other = tables
            .get(&join[1])
            .ok_or_else(|| db_error(QueryErrorKind::NotFound, sql, "no such table"))?;
        let using = idents(&join[2]);
        joined = joined
            .into_iter()
            .filter_map(|left| {
                let right = other.rows.iter().find(|right| {
                    using.iter().all(|c| match (left.get(c), right.get(c)) {
                        (Some(a), Some(b)) => a.key_eq(b),
                        _ => false,
                    })
                })?;
                let mut merged = left;
                merged.extend(right.clone());
                Some(merged)
            })
            .collect();
    }

    Ok(joined
        .into_iter()
        .filter(|record| matches(record, &filter))
        .map(|record| {
            let values = columns
                .iter()
                .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            Row::new(columns.clone(), values)
        })
        .collect())
}

// ============================================================================
// Database, provider, connection
// ============================================================================

/// Shared committed state.
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        let db = Self::default();
        db.lock().next_id = 1000;
        db
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory db lock")
    }

    pub fn create_table(&self, name: &str, keys: &[&str], auto_key: bool) -> &Self {
        self.lock().tables.insert(
            name.to_string(),
            Table {
                keys: keys.iter().map(|k| (*k).to_string()).collect(),
                auto_key,
                rows: Vec::new(),
            },
        );
        self
    }

    /// Insert a committed row directly.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> &Self {
        let record: Record = values
            .iter()
            .map(|(c, v)| ((*c).to_string(), v.clone()))
            .collect();
        let mut inner = self.lock();
        let write = Write::Insert {
            table: table.to_string(),
            record,
        };
        apply(&mut inner.tables, &write, "seed").expect("seed row");
        self
    }

    /// Update committed rows directly, as another process would.
    pub fn update_committed(&self, table: &str, filter: &[(&str, Value)], set: &[(&str, Value)]) -> u64 {
        let pairs = |items: &[(&str, Value)]| {
            items
                .iter()
                .map(|(c, v)| ((*c).to_string(), v.clone()))
                .collect::<Vec<_>>()
        };
        let write = Write::Update {
            table: table.to_string(),
            set: pairs(set),
            filter: pairs(filter),
        };
        apply(&mut self.lock().tables, &write, "external update").expect("external update")
    }

    /// Committed rows of `table` matching `filter`.
    pub fn rows(&self, table: &str, filter: &[(&str, Value)]) -> Vec<BTreeMap<String, Value>> {
        let filter: Vec<(String, Value)> = filter
            .iter()
            .map(|(c, v)| ((*c).to_string(), v.clone()))
            .collect();
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| matches(r, &filter)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Fail every statement containing `fragment`.
    pub fn fail_on(&self, fragment: &str) {
        self.lock().fail_on.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_on.clear();
    }

    /// Make queries wait until the returned sender fires (or is dropped).
    pub fn hold_queries(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().gate = Some(rx.shared());
        tx
    }

    pub fn provider(&self) -> MemoryProvider {
        MemoryProvider { db: self.clone() }
    }
}

#[derive(Clone)]
pub struct MemoryProvider {
    db: MemoryDb,
}

impl ConnectionProvider for MemoryProvider {
    type Conn = MemoryConnection;

    async fn connect(&self, _cx: &Cx, _config: &TransactionConfig) -> Outcome<MemoryConnection, Error> {
        self.db.lock().stats.connects += 1;
        Outcome::Ok(MemoryConnection {
            db: self.db.clone(),
            pending: Mutex::new(Vec::new()),
        })
    }
}

/// One transaction: writes stay in `pending` until commit.
pub struct MemoryConnection {
    db: MemoryDb,
    pending: Mutex<Vec<(Write, String)>>,
}

impl MemoryConnection {
    /// Committed state with this connection's pending writes replayed.
    fn view(&self, inner: &Inner) -> Tables {
        let mut tables = inner.tables.clone();
        for (write, sql) in self.pending.lock().expect("pending lock").iter() {
            let _ = apply(&mut tables, write, sql);
        }
        tables
    }

    fn check_failure(inner: &Inner, sql: &str) -> Result<()> {
        match inner.fail_on.iter().find(|f| sql.contains(f.as_str())) {
            Some(fragment) => Err(db_error(
                QueryErrorKind::Database,
                sql,
                format!("injected failure on '{fragment}'"),
            )),
            None => Ok(()),
        }
    }
}

impl Connection for MemoryConnection {
    async fn query(&self, _cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let gate = {
            let mut inner = self.db.lock();
            inner.stats.queries += 1;
            inner.statements.push(sql.to_string());
            inner.gate.clone()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let inner = self.db.lock();
        if let Err(e) = Self::check_failure(&inner, sql) {
            return Outcome::Err(e);
        }
        let tables = self.view(&inner);
        match run_select(&tables, sql, params) {
            Ok(rows) => Outcome::Ok(rows),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn execute(&self, _cx: &Cx, sql: &str, params: &[Value]) -> Outcome<ExecResult, Error> {
        let mut inner = self.db.lock();
        inner.stats.executes += 1;
        inner.statements.push(sql.to_string());
        if let Err(e) = Self::check_failure(&inner, sql) {
            return Outcome::Err(e);
        }
        let mut write = match parse_write(sql, params) {
            Ok(write) => write,
            Err(e) => return Outcome::Err(e),
        };

        let mut generated = Vec::new();
        if let Write::Insert { table, record } = &mut write {
            let auto_key = inner
                .tables
                .get(table.as_str())
                .filter(|schema| schema.auto_key)
                .and_then(|schema| schema.keys.first().cloned());
            if let Some(key) = auto_key {
                if !record.contains_key(&key) {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    record.insert(key, Value::BigInt(id));
                    generated.push(Value::BigInt(id));
                }
            }
        }

        let mut tables = self.view(&inner);
        match apply(&mut tables, &write, sql) {
            Ok(affected) => {
                if affected > 0 {
                    self.pending
                        .lock()
                        .expect("pending lock")
                        .push((write, sql.to_string()));
                }
                let mut result = ExecResult::affected(affected);
                result.generated_keys = generated;
                Outcome::Ok(result)
            }
            Err(e) => Outcome::Err(e),
        }
    }

    async fn commit(&self, _cx: &Cx) -> Outcome<(), Error> {
        let writes = std::mem::take(&mut *self.pending.lock().expect("pending lock"));
        let mut inner = self.db.lock();
        for (write, sql) in &writes {
            if let Err(e) = apply(&mut inner.tables, write, sql) {
                return Outcome::Err(e);
            }
        }
        inner.stats.commits += 1;
        Outcome::Ok(())
    }

    async fn rollback(&self, _cx: &Cx) -> Outcome<(), Error> {
        self.pending.lock().expect("pending lock").clear();
        self.db.lock().stats.rollbacks += 1;
        Outcome::Ok(())
    }

    async fn close(self, _cx: &Cx) -> Result<()> {
        self.db.lock().stats.closes += 1;
        Ok(())
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub version: i64,
    pub heroes: DeferredList<Hero>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            version: 0,
            heroes: DeferredList::detached(),
        }
    }
}

impl Entity for Team {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("teams")
            .key(KeyField::new("id").generated())
            .column("name")
            .version("version")
            .reference(ReferenceDecl::to::<Hero>("heroes").foreign_columns(&["team_id"]))
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
            heroes: row.collection("heroes")?,
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

#[derive(Debug, Clone)]
pub struct Hero {
    pub id: Option<i64>,
    pub name: String,
    pub version: i64,
    pub team: DeferredRef<Team>,
    pub powers: DeferredList<Power>,
}

impl Hero {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            version: 0,
            team: DeferredRef::null(),
            powers: DeferredList::detached(),
        }
    }
}

impl Entity for Hero {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("heroes")
            .key(KeyField::new("id").generated())
            .columns(&["name", "team_id"])
            .version("version")
            .reference(ReferenceDecl::to::<Team>("team").local_columns(&["team_id"]))
            .reference(ReferenceDecl::to::<Power>("powers").join_table(JoinTable::new(
                "hero_powers",
                &["hero_id"],
                &["power_id"],
            )))
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("team_id", self.team.key_value()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &RowContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            version: row.get("version")?,
            team: row.reference("team")?,
            powers: row.collection("powers")?,
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

#[derive(Debug, Clone, PartialEq)]
pub struct Power {
    pub id: i64,
    pub name: String,
}

impl Entity for Power {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("powers")
            .key(KeyField::new("id"))
            .column("name")
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &RowContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }
}

/// Two table layers: `people` (root, versioned) and `employees`.
#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub salary: i64,
    pub version: i64,
}

impl Entity for Employee {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("employees")
            .base(TableLayer::new("people").column("name"))
            .key(KeyField::new("id").generated())
            .column("salary")
            .version("version")
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("salary", self.salary.into()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &RowContext<'_>) -> Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            salary: row.get("salary")?,
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

/// Composite-keyed association row.
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub team_id: i64,
    pub hero_id: i64,
    pub role: String,
}

impl Entity for Membership {
    fn describe() -> EntityDescriptor {
        EntityDescriptor::new("memberships")
            .key(KeyField::new("team_id"))
            .key(KeyField::new("hero_id"))
            .column("role")
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("team_id", self.team_id.into()),
            ("hero_id", self.hero_id.into()),
            ("role", self.role.clone().into()),
        ]
    }

    fn from_row(row: &RowContext<'_>) -> Result<Self> {
        Ok(Self {
            team_id: row.get("team_id")?,
            hero_id: row.get("hero_id")?,
            role: row.get("role")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.team_id.into(), self.hero_id.into()]
    }
}

/// The fixture used by most tests:
///
/// - team 1 "Avengers" (v1) with heroes 10 and 11
/// - hero 10 "Spider-Boy" (v1), powers 100 and 101
/// - hero 11 "Rusty-Man" (v3), no powers
/// - hero 12 "Deadpond" (v1), no team
/// - employee 20 "Ann" (v1)
pub fn seeded() -> MemoryDb {
    let db = MemoryDb::new();
    db.create_table("teams", &["id"], true)
        .create_table("heroes", &["id"], true)
        .create_table("powers", &["id"], false)
        .create_table("hero_powers", &["hero_id", "power_id"], false)
        .create_table("people", &["id"], true)
        .create_table("employees", &["id"], false)
        .create_table("memberships", &["team_id", "hero_id"], false);

    db.seed(
        "teams",
        &[("id", 1_i64.into()), ("name", "Avengers".into()), ("version", 1_i64.into())],
    );
    for (id, name, team, version) in [
        (10_i64, "Spider-Boy", Some(1_i64), 1_i64),
        (11, "Rusty-Man", Some(1), 3),
        (12, "Deadpond", None, 1),
    ] {
        db.seed(
            "heroes",
            &[
                ("id", id.into()),
                ("name", name.into()),
                ("team_id", team.into()),
                ("version", version.into()),
            ],
        );
    }
    for (id, name) in [(100_i64, "Web"), (101, "Wall crawl")] {
        db.seed("powers", &[("id", id.into()), ("name", name.into())]);
        db.seed(
            "hero_powers",
            &[("hero_id", 10_i64.into()), ("power_id", id.into())],
        );
    }
    db.seed(
        "people",
        &[("id", 20_i64.into()), ("name", "Ann".into()), ("version", 1_i64.into())],
    );
    db.seed("employees", &[("id", 20_i64.into()), ("salary", 5000_i64.into())]);
    db
}

pub fn store(db: &MemoryDb) -> Store<MemoryProvider> {
    Store::builder(db.provider())
        .register::<Team>()
        .register::<Hero>()
        .register::<Power>()
        .register::<Employee>()
        .register::<Membership>()
        .build()
        .expect("build store")
}

pub fn is_finished(err: &Error) -> bool {
    matches!(err.root(), Error::Usage(u) if u.kind == UsageErrorKind::Finished)
}
