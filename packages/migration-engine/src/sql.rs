//! Postgres-backed source provider and ID map.
//!
//! Both use the non-macro sqlx API with plain parameterized queries so
//! the crate builds without a live database. All values are fetched as
//! text (`column::text`) to keep row decoding uniform across source
//! schemas; `IdValue::coerce` turns textual ids back into integers
//! where the definition declares them as such.
//!
//! Expected ID map table (owned externally, see the CLI docs):
//!
//! ```sql
//! CREATE TABLE migrate_id_map (
//!     migration   TEXT        NOT NULL,
//!     source_key  TEXT        NOT NULL,
//!     destination TEXT,
//!     row_hash    TEXT        NOT NULL,
//!     status      TEXT        NOT NULL,
//!     imported_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (migration, source_key)
//! );
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Row as SqlxRow};
use tracing::debug;

use crate::error::SourceError;
use crate::id_map::{IdMap, IdMapEntry};
use crate::registry::MigrationDefinition;
use crate::row::Row;
use crate::source::{RowStream, SourceRowProvider};
use crate::types::{DestinationId, IdValue, MigrationId, RowStatus};

/// Rows fetched per page by the SQL row stream.
const PAGE_SIZE: i64 = 500;

/// Reject identifiers that cannot be safely interpolated into SQL.
/// Bind parameters cover values; table and column names come from
/// migration definitions and are restricted to word characters.
fn ident(name: &str) -> Result<&str, SourceError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(SourceError::query(format!("invalid identifier {name:?}")))
    }
}

fn map_sqlx_err(err: sqlx::Error) -> SourceError {
    match &err {
        // Schema-level rejection: the query itself is wrong for this
        // source.
        sqlx::Error::Database(db) => SourceError::query(db.to_string()),
        sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => {
            SourceError::query(err.to_string())
        }
        // Everything else is connectivity: retryable on a later run.
        _ => SourceError::unavailable(err.to_string()),
    }
}

fn bind_constraint<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::Bool(b) => query.bind(*b),
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Source row provider over an external relational store.
#[derive(Clone)]
pub struct SqlSourceProvider {
    pool: PgPool,
    /// Optional prefix prepended to every table name (multi-site
    /// sources share one database with per-site prefixes).
    table_prefix: String,
}

impl SqlSourceProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table_prefix: String::new(),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    fn table_name(&self, table: &str) -> Result<String, SourceError> {
        ident(table)?;
        if !self.table_prefix.is_empty() {
            ident(&self.table_prefix)?;
        }
        Ok(format!("{}{}", self.table_prefix, table))
    }

    /// SELECT with every column cast to text, stable ORDER BY, and
    /// the definition's equality constraints as bind parameters.
    fn build_select(&self, def: &MigrationDefinition) -> Result<String, SourceError> {
        let table = self.table_name(&def.source.table)?;
        let mut columns = Vec::with_capacity(def.source.columns.len());
        for column in &def.source.columns {
            let column = ident(column)?;
            columns.push(format!("{column}::text AS {column}"));
        }

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
        if !def.source.constraints.is_empty() {
            let mut clauses = Vec::new();
            for (i, field) in def.source.constraints.keys().enumerate() {
                clauses.push(format!("{} = ${}", ident(field)?, i + 1));
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        // Fall back to the ID fields so the order is always total;
        // the resume cursor depends on it.
        let order_by: Vec<&String> = if def.source.order_by.is_empty() {
            def.ids.iter().map(|f| &f.name).collect()
        } else {
            def.source.order_by.iter().collect()
        };
        let mut order_parts = Vec::with_capacity(order_by.len());
        for field in order_by {
            order_parts.push(ident(field)?.to_string());
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_parts.join(", "));
        Ok(sql)
    }

    async fn fetch_page(
        &self,
        def: &MigrationDefinition,
        offset: u64,
    ) -> Result<Vec<Row>, SourceError> {
        let base = self.build_select(def)?;
        let sql = format!("{base} LIMIT {PAGE_SIZE} OFFSET {offset}");
        debug!(migration = %def.id, %sql, "fetching source page");

        let mut query = sqlx::query(&sql);
        for value in def.source.constraints.values() {
            query = bind_constraint(query, value);
        }
        let records = query
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let mut fields = Vec::with_capacity(def.source.columns.len());
            for (i, column) in def.source.columns.iter().enumerate() {
                let raw: Option<String> = record.try_get(i).map_err(map_sqlx_err)?;
                fields.push((column.clone(), raw.map(Value::String).unwrap_or(Value::Null)));
            }
            let mut ids = Vec::with_capacity(def.ids.len());
            for id_field in &def.ids {
                let raw = fields
                    .iter()
                    .find(|(name, _)| *name == id_field.name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                let id = IdValue::coerce(&raw, id_field.kind).ok_or_else(|| {
                    SourceError::query(format!(
                        "row in {} has no usable id value for field {}",
                        def.source.table, id_field.name
                    ))
                })?;
                ids.push(id);
            }
            rows.push(Row::new(ids, fields));
        }
        Ok(rows)
    }
}

/// Paged stream over a stable ORDER BY: each page re-queries at the
/// next offset, so no connection is held across suspension points.
struct SqlRowStream {
    provider: SqlSourceProvider,
    def: MigrationDefinition,
    offset: u64,
    buffer: std::vec::IntoIter<Row>,
    exhausted: bool,
}

#[async_trait]
impl RowStream for SqlRowStream {
    async fn fetch_next(&mut self) -> Result<Option<Row>, SourceError> {
        loop {
            if let Some(row) = self.buffer.next() {
                self.offset += 1;
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = self.provider.fetch_page(&self.def, self.offset).await?;
            if (page.len() as i64) < PAGE_SIZE {
                self.exhausted = true;
            }
            if page.is_empty() {
                return Ok(None);
            }
            self.buffer = page.into_iter();
        }
    }
}

#[async_trait]
impl SourceRowProvider for SqlSourceProvider {
    async fn open(
        &self,
        def: &MigrationDefinition,
        offset: u64,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        // Validate the query shape eagerly so a bad definition fails
        // at open, not first fetch.
        self.build_select(def)?;
        Ok(Box::new(SqlRowStream {
            provider: self.clone(),
            def: def.clone(),
            offset,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }))
    }

    async fn detail(
        &self,
        table: &str,
        match_field: &str,
        key: &IdValue,
        value_field: &str,
    ) -> Result<Vec<Value>, SourceError> {
        let table = self.table_name(table)?;
        let sql = format!(
            "SELECT {}::text FROM {} WHERE {}::text = $1 ORDER BY 1",
            ident(value_field)?,
            table,
            ident(match_field)?,
        );
        let records = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let raw: Option<String> = record.try_get(0).map_err(map_sqlx_err)?;
            values.push(raw.map(Value::String).unwrap_or(Value::Null));
        }
        Ok(values)
    }

    async fn supports(&self, def: &MigrationDefinition) -> Result<bool, SourceError> {
        let base = match self.build_select(def) {
            Ok(base) => base,
            Err(_) => return Ok(false),
        };
        let sql = format!("{base} LIMIT 0");
        let mut query = sqlx::query(&sql);
        for value in def.source.constraints.values() {
            query = bind_constraint(query, value);
        }
        match query.fetch_all(&self.pool).await {
            Ok(_) => Ok(true),
            // Missing tables or columns mean "cannot serve this
            // definition"; connectivity problems stay errors.
            Err(sqlx::Error::Database(_)) => Ok(false),
            Err(err) => Err(map_sqlx_err(err)),
        }
    }

    async fn distinct_values(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<Value>, SourceError> {
        let table = self.table_name(table)?;
        let column = ident(column)?;
        let sql = format!(
            "SELECT DISTINCT {column}::text FROM {table} WHERE {column} IS NOT NULL ORDER BY 1"
        );
        let records = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let raw: String = record.try_get(0).map_err(map_sqlx_err)?;
            values.push(Value::String(raw));
        }
        Ok(values)
    }

    async fn estimate(&self, def: &MigrationDefinition) -> Result<Option<u64>, SourceError> {
        let table = self.table_name(&def.source.table)?;
        let mut sql = format!("SELECT COUNT(*) FROM {table}");
        if !def.source.constraints.is_empty() {
            let mut clauses = Vec::new();
            for (i, field) in def.source.constraints.keys().enumerate() {
                clauses.push(format!("{} = ${}", ident(field)?, i + 1));
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in def.source.constraints.values() {
            query = match value {
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
                Value::Number(n) => query.bind(n.as_f64()),
                Value::Bool(b) => query.bind(*b),
                Value::String(s) => query.bind(s.as_str()),
                other => query.bind(other.to_string()),
            };
        }
        let count = query.fetch_one(&self.pool).await.map_err(map_sqlx_err)?;
        Ok(Some(count as u64))
    }
}

#[derive(Debug, FromRow)]
struct IdMapRow {
    migration: String,
    source_key: String,
    destination: Option<String>,
    row_hash: String,
    status: String,
    imported_at: DateTime<Utc>,
}

impl From<IdMapRow> for IdMapEntry {
    fn from(row: IdMapRow) -> Self {
        IdMapEntry {
            migration: MigrationId::new(row.migration),
            source_key: row.source_key,
            destination: row.destination.map(DestinationId::new),
            row_hash: row.row_hash,
            status: RowStatus::parse(&row.status),
            imported_at: row.imported_at,
        }
    }
}

/// ID map persisted in Postgres. Upserts via ON CONFLICT give the
/// last-writer-wins semantics the executor relies on.
pub struct PgIdMap {
    pool: PgPool,
}

impl PgIdMap {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdMap for PgIdMap {
    async fn lookup(
        &self,
        migration: &MigrationId,
        source_key: &str,
    ) -> Result<Option<IdMapEntry>> {
        let row = sqlx::query_as::<_, IdMapRow>(
            r#"
            SELECT migration, source_key, destination, row_hash, status, imported_at
            FROM migrate_id_map
            WHERE migration = $1 AND source_key = $2
            "#,
        )
        .bind(migration.as_str())
        .bind(source_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn save(&self, entry: IdMapEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migrate_id_map (migration, source_key, destination, row_hash, status, imported_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (migration, source_key) DO UPDATE SET
                destination = $3,
                row_hash = $4,
                status = $5,
                imported_at = $6
            "#,
        )
        .bind(entry.migration.as_str())
        .bind(&entry.source_key)
        .bind(entry.destination.as_ref().map(|d| d.as_str()))
        .bind(&entry.row_hash)
        .bind(entry.status.as_str())
        .bind(entry.imported_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entries(&self, migration: &MigrationId) -> Result<Vec<IdMapEntry>> {
        let rows = sqlx::query_as::<_, IdMapRow>(
            r#"
            SELECT migration, source_key, destination, row_hash, status, imported_at
            FROM migrate_id_map
            WHERE migration = $1
            ORDER BY source_key
            "#,
        )
        .bind(migration.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn rollback(&self, migration: &MigrationId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM migrate_id_map WHERE migration = $1")
            .bind(migration.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn processed_count(&self, migration: &MigrationId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM migrate_id_map WHERE migration = $1")
                .bind(migration.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}
