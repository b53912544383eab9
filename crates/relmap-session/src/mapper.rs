//! SQL mapper: entity metadata plus values in, parameterized SQL out.
//!
//! Statements use double-quoted identifiers and `$n` placeholders. Layered
//! entities read through `JOIN .. USING (key)` and write one statement per
//! table layer.

use relmap_core::error::TypeError;
use relmap_core::{
    ConflictError, Connection, Cx, Entity, EntityMeta, Error, ExecResult, IdentityKey, JoinTable,
    Outcome, QueryError, QueryErrorKind, Result, Row, RowContext, Value,
};
use std::collections::HashMap;

/// A SQL string with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Bind `value` and return its placeholder.
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    /// Append `"a" = $1 AND "b" = $2` for the given pairs.
    fn push_conditions<'v>(&mut self, pairs: impl IntoIterator<Item = (&'v str, Value)>) {
        let mut first = true;
        for (column, value) in pairs {
            if !first {
                self.sql.push_str(" AND ");
            }
            first = false;
            let placeholder = self.bind(value);
            self.sql
                .push_str(&format!("{} = {}", quote_ident(column), placeholder));
        }
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column values of one entity, looked up by name.
struct RowValues {
    entity: &'static str,
    values: HashMap<&'static str, Value>,
}

impl RowValues {
    fn of<E: Entity>(meta: &EntityMeta, entity: &E) -> Self {
        Self {
            entity: meta.entity(),
            values: entity.to_row().into_iter().collect(),
        }
    }

    #[allow(clippy::result_large_err)]
    fn get(&self, column: &str) -> Result<Value> {
        self.values.get(column).cloned().ok_or_else(|| {
            Error::metadata(
                self.entity,
                format!("to_row() does not provide column '{column}'"),
            )
        })
    }
}

/// Builds and runs the statements for one entity type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlMapper {
    log_sql: bool,
}

impl SqlMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit every statement at debug level.
    pub fn log_sql(mut self, enabled: bool) -> Self {
        self.log_sql = enabled;
        self
    }

    fn select_prefix(meta: &EntityMeta) -> String {
        let keys = meta.key_columns();
        let mut sql = format!(
            "SELECT {} FROM {}",
            quote_list(&meta.select_columns()),
            quote_ident(meta.table())
        );
        for layer in &meta.layers()[1..] {
            sql.push_str(&format!(
                " JOIN {} USING ({})",
                quote_ident(layer.table),
                quote_list(&keys)
            ));
        }
        sql
    }

    /// `SELECT .. WHERE key = $n`.
    #[allow(clippy::result_large_err)]
    pub fn select_by_key(&self, meta: &EntityMeta, key: &IdentityKey) -> Result<Statement> {
        let keys = meta.key_columns();
        if key.arity() != keys.len() {
            return Err(Error::metadata(
                meta.entity(),
                format!(
                    "key {} has {} components but the entity has {} key columns",
                    key,
                    key.arity(),
                    keys.len()
                ),
            ));
        }
        let mut stmt = Statement::new();
        stmt.sql = Self::select_prefix(meta);
        stmt.sql.push_str(" WHERE ");
        stmt.push_conditions(keys.into_iter().zip(key.values().iter().cloned()));
        Ok(stmt)
    }

    /// `SELECT .. WHERE col = $n AND ..`, or every row for an empty filter.
    pub fn select_where(&self, meta: &EntityMeta, filter: &[(&'static str, Value)]) -> Statement {
        let mut stmt = Statement::new();
        stmt.sql = Self::select_prefix(meta);
        if !filter.is_empty() {
            stmt.sql.push_str(" WHERE ");
            stmt.push_conditions(filter.iter().cloned());
        }
        stmt
    }

    /// Target key columns of the association rows owned by `owner`.
    pub fn select_join_keys(&self, join: &JoinTable, owner: &IdentityKey) -> Statement {
        let mut stmt = Statement::new();
        stmt.sql = format!(
            "SELECT {} FROM {} WHERE ",
            quote_list(&join.target_columns),
            quote_ident(join.table)
        );
        stmt.push_conditions(
            join.owner_columns
                .iter()
                .copied()
                .zip(owner.values().iter().cloned()),
        );
        stmt
    }

    /// INSERT for one layer. Generated key columns are omitted from the
    /// root layer when `omit_generated` is set.
    #[allow(clippy::result_large_err)]
    fn insert_layer(
        meta: &EntityMeta,
        layer_index: usize,
        values: &RowValues,
        omit_generated: bool,
    ) -> Result<Statement> {
        let layer = &meta.layers()[layer_index];
        let mut columns: Vec<&str> = meta
            .keys()
            .iter()
            .filter(|k| !(omit_generated && layer_index == 0 && k.generated))
            .map(|k| k.column)
            .collect();
        columns.extend(layer.columns.iter().copied());

        let mut stmt = Statement::new();
        let mut placeholders = Vec::with_capacity(columns.len());
        for column in &columns {
            placeholders.push(stmt.bind(values.get(column)?));
        }
        stmt.sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(layer.table),
            quote_list(&columns),
            placeholders.join(", ")
        );
        Ok(stmt)
    }

    /// UPDATE for one layer, or `None` when the layer has nothing to set.
    /// `expected_version` adds the optimistic check to the WHERE clause.
    #[allow(clippy::result_large_err)]
    fn update_layer(
        meta: &EntityMeta,
        layer_index: usize,
        values: &RowValues,
        key: &IdentityKey,
        expected_version: Option<i64>,
    ) -> Result<Option<Statement>> {
        let layer = &meta.layers()[layer_index];
        if layer.columns.is_empty() {
            return Ok(None);
        }

        let mut stmt = Statement::new();
        let mut assignments = Vec::with_capacity(layer.columns.len());
        for column in &layer.columns {
            let placeholder = stmt.bind(values.get(column)?);
            assignments.push(format!("{} = {}", quote_ident(column), placeholder));
        }
        stmt.sql = format!(
            "UPDATE {} SET {} WHERE ",
            quote_ident(layer.table),
            assignments.join(", ")
        );
        stmt.push_conditions(meta.key_columns().into_iter().zip(key.values().iter().cloned()));
        if let (Some(column), Some(version)) = (meta.version_column(), expected_version) {
            stmt.push_conditions([(column, Value::BigInt(version))]);
        }
        Ok(Some(stmt))
    }

    /// DELETE for one layer, with the version check on the root.
    fn delete_layer(
        meta: &EntityMeta,
        layer_index: usize,
        key: &IdentityKey,
        version: Option<i64>,
    ) -> Statement {
        let layer = &meta.layers()[layer_index];
        let mut stmt = Statement::new();
        stmt.sql = format!("DELETE FROM {} WHERE ", quote_ident(layer.table));
        stmt.push_conditions(meta.key_columns().into_iter().zip(key.values().iter().cloned()));
        if layer_index == 0 {
            if let (Some(column), Some(version)) = (meta.version_column(), version) {
                stmt.push_conditions([(column, Value::BigInt(version))]);
            }
        }
        stmt
    }

    async fn run_query<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        stmt: &Statement,
    ) -> Outcome<Vec<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if self.log_sql {
            tracing::debug!(sql = %stmt.sql, params = stmt.params.len(), "Query");
        }
        conn.query(cx, &stmt.sql, &stmt.params).await
    }

    async fn run_execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        stmt: &Statement,
    ) -> Outcome<ExecResult, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if self.log_sql {
            tracing::debug!(sql = %stmt.sql, params = stmt.params.len(), "Execute");
        }
        conn.execute(cx, &stmt.sql, &stmt.params).await
    }

    #[allow(clippy::result_large_err)]
    fn map_row<E: Entity>(meta: &EntityMeta, row: &Row) -> Result<E> {
        E::from_row(&RowContext::new(row, meta))
    }

    /// Fetch one entity by key.
    pub async fn fetch_by_key<E: Entity, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        meta: &EntityMeta,
        key: &IdentityKey,
    ) -> Outcome<Option<E>, Error> {
        let stmt = match self.select_by_key(meta, key) {
            Ok(stmt) => stmt,
            Err(e) => return Outcome::Err(e),
        };
        let rows = match self.run_query(cx, conn, &stmt).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if rows.len() > 1 {
            tracing::warn!(
                table = meta.table(),
                key = %key,
                rows = rows.len(),
                "Key lookup matched more than one row; using the first"
            );
        }
        match rows.first() {
            Some(row) => match Self::map_row(meta, row) {
                Ok(entity) => Outcome::Ok(Some(entity)),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(None),
        }
    }

    /// Fetch every entity matching `filter`.
    pub async fn fetch_where<E: Entity, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        meta: &EntityMeta,
        filter: &[(&'static str, Value)],
    ) -> Outcome<Vec<E>, Error> {
        let stmt = self.select_where(meta, filter);
        let rows = match self.run_query(cx, conn, &stmt).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match rows.iter().map(|row| Self::map_row(meta, row)).collect() {
            Ok(entities) => Outcome::Ok(entities),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Read target keys from an association table.
    pub async fn fetch_join_keys<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        join: &JoinTable,
        owner: &IdentityKey,
    ) -> Outcome<Vec<IdentityKey>, Error> {
        let stmt = self.select_join_keys(join, owner);
        let rows = match self.run_query(cx, conn, &stmt).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = match row.project(&join.target_columns) {
                Ok(values) => values,
                Err(e) => return Outcome::Err(e),
            };
            match IdentityKey::from_values(values) {
                Some(key) => keys.push(key),
                None => {
                    return Outcome::Err(Error::Type(TypeError {
                        expected: "non-NULL key",
                        actual: "NULL".to_string(),
                        column: Some(join.target_columns.join(", ")),
                        rust_type: None,
                    }));
                }
            }
        }
        Outcome::Ok(keys)
    }

    /// Insert `entity`, writing back generated keys and the initial version.
    pub async fn insert<E: Entity, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        meta: &EntityMeta,
        entity: &mut E,
        initial_version: i64,
    ) -> Outcome<(), Error> {
        if meta.version_column().is_some() {
            entity.set_version(initial_version);
        }
        let needs_generated = entity.identity_key().is_none();
        if needs_generated && !meta.has_generated_key() {
            return Outcome::Err(Error::metadata(
                meta.entity(),
                "cannot insert an entity without a key into a table with no generated key",
            ));
        }

        for index in 0..meta.layers().len() {
            let omit_generated = index == 0 && needs_generated;
            let values = RowValues::of(meta, entity);
            let stmt = match Self::insert_layer(meta, index, &values, omit_generated) {
                Ok(stmt) => stmt,
                Err(e) => return Outcome::Err(e),
            };
            let result = match self.run_execute(cx, conn, &stmt).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if result.rows_affected == 0 {
                return Outcome::Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Database,
                    sql: Some(stmt.sql),
                    sqlstate: None,
                    message: "insert affected no rows".to_string(),
                    source: None,
                }));
            }
            if omit_generated {
                let expected = meta.generated_key_columns().len();
                if result.generated_keys.len() != expected {
                    return Outcome::Err(Error::Query(QueryError {
                        kind: QueryErrorKind::Database,
                        sql: Some(stmt.sql),
                        sqlstate: None,
                        message: format!(
                            "insert returned {} generated keys, expected {}",
                            result.generated_keys.len(),
                            expected
                        ),
                        source: None,
                    }));
                }
                entity.set_generated_keys(&result.generated_keys);
                if entity.identity_key().is_none() {
                    return Outcome::Err(Error::metadata(
                        meta.entity(),
                        "set_generated_keys() did not assign a complete key",
                    ));
                }
            }
        }

        tracing::debug!(
            entity = meta.entity(),
            table = meta.table(),
            key = ?entity.identity_key().map(|k| k.to_string()),
            "Inserted"
        );
        Outcome::Ok(())
    }

    /// Update `entity` with an optimistic version check, bumping its version.
    /// Zero affected rows is a [`Error::Conflict`].
    pub async fn update<E: Entity, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        meta: &EntityMeta,
        entity: &mut E,
    ) -> Outcome<(), Error> {
        let Some(key) = entity.identity_key() else {
            return Outcome::Err(Error::metadata(meta.entity(), "cannot update without a key"));
        };
        let expected = match (meta.version_column(), entity.version()) {
            (Some(_), Some(v)) => Some(v),
            (Some(column), None) => {
                return Outcome::Err(Error::metadata(
                    meta.entity(),
                    format!("version column '{column}' declared but version() returned None"),
                ));
            }
            (None, _) => None,
        };
        if let Some(v) = expected {
            entity.set_version(v + 1);
        }

        let values = RowValues::of(meta, entity);
        for index in 0..meta.layers().len() {
            let check = if index == 0 { expected } else { None };
            let stmt = match Self::update_layer(meta, index, &values, &key, check) {
                Ok(Some(stmt)) => stmt,
                Ok(None) => continue,
                Err(e) => return Outcome::Err(e),
            };
            let result = match self.run_execute(cx, conn, &stmt).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if result.rows_affected == 0 {
                return Outcome::Err(Self::conflict(meta, &key, expected, stmt));
            }
        }

        tracing::debug!(
            entity = meta.entity(),
            table = meta.table(),
            key = %key,
            version = ?entity.version(),
            "Updated"
        );
        Outcome::Ok(())
    }

    /// Delete `entity`, most-derived layer first. Zero affected rows is a
    /// [`Error::Conflict`].
    pub async fn delete<E: Entity, C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        meta: &EntityMeta,
        entity: &E,
    ) -> Outcome<(), Error> {
        let Some(key) = entity.identity_key() else {
            return Outcome::Err(Error::metadata(meta.entity(), "cannot delete without a key"));
        };
        let version = meta.version_column().and(entity.version());

        for index in (0..meta.layers().len()).rev() {
            let stmt = Self::delete_layer(meta, index, &key, version);
            let result = match self.run_execute(cx, conn, &stmt).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if result.rows_affected == 0 {
                let check = if index == 0 { version } else { None };
                return Outcome::Err(Self::conflict(meta, &key, check, stmt));
            }
        }

        tracing::debug!(entity = meta.entity(), table = meta.table(), key = %key, "Deleted");
        Outcome::Ok(())
    }

    fn conflict(
        meta: &EntityMeta,
        key: &IdentityKey,
        expected_version: Option<i64>,
        stmt: Statement,
    ) -> Error {
        tracing::warn!(
            entity = meta.entity(),
            table = meta.table(),
            key = %key,
            expected_version = ?expected_version,
            "Optimistic concurrency conflict"
        );
        Error::Conflict(ConflictError {
            table: meta.table().to_string(),
            key: key.to_string(),
            expected_version,
            sql: Some(stmt.sql),
        })
    }
}
