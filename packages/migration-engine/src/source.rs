//! Source row providers: the seam between the pipeline and the
//! external store the rows come from.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SourceError;
use crate::registry::MigrationDefinition;
use crate::row::Row;
use crate::types::{IdValue, IdValueKind};

/// A lazy, finite sequence of source rows for one migration.
///
/// Providers must return rows in a stable order between runs (the
/// cursor that makes interrupted migrations resumable is an offset
/// into this order), and parent rows before child rows where the
/// definition's `order_by` says so.
#[async_trait]
pub trait RowStream: Send {
    async fn fetch_next(&mut self) -> Result<Option<Row>, SourceError>;
}

/// Produces row streams and read-only detail lookups for migrations.
#[async_trait]
pub trait SourceRowProvider: Send + Sync {
    /// Open the definition's query, skipping the first `offset` rows.
    ///
    /// `offset` is a resume cursor from an interrupted run; providers
    /// honor it against the same stable order they stream in.
    async fn open(
        &self,
        def: &MigrationDefinition,
        offset: u64,
    ) -> Result<Box<dyn RowStream>, SourceError>;

    /// Read-only one-to-many detail lookup used by the transformer
    /// (e.g. a node's taxonomy terms keyed by node id). Returns the
    /// `value_field` values of rows in `table` whose `match_field`
    /// equals `key`.
    async fn detail(
        &self,
        table: &str,
        match_field: &str,
        key: &IdValue,
        value_field: &str,
    ) -> Result<Vec<Value>, SourceError>;

    /// Capability check: can this provider satisfy the definition's
    /// source shape? A `false` answer bypasses the migration as
    /// skipped rather than failing it.
    async fn supports(&self, def: &MigrationDefinition) -> Result<bool, SourceError>;

    /// Distinct non-null values of one column, in a stable order.
    /// Template fan-out resolves its variant axis through this at
    /// registry-load time.
    async fn distinct_values(&self, table: &str, column: &str)
        -> Result<Vec<Value>, SourceError>;

    /// Best-effort row count for progress reporting. `None` when the
    /// source cannot count cheaply.
    async fn estimate(&self, def: &MigrationDefinition) -> Result<Option<u64>, SourceError> {
        let _ = def;
        Ok(None)
    }
}

/// In-memory provider over fixture tables. Serves tests and small
/// file-loaded sources; also the reference implementation of the
/// ordering and offset contracts.
#[derive(Debug, Default, Clone)]
pub struct InMemorySourceProvider {
    tables: HashMap<String, Vec<Vec<(String, Value)>>>,
}

impl InMemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table of rows, each row a list of (field, value) pairs in
    /// declared column order.
    pub fn with_table(
        mut self,
        name: impl Into<String>,
        rows: Vec<Vec<(String, Value)>>,
    ) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }

    pub fn insert_table(&mut self, name: impl Into<String>, rows: Vec<Vec<(String, Value)>>) {
        self.tables.insert(name.into(), rows);
    }

    fn build_rows(&self, def: &MigrationDefinition) -> Result<Vec<Row>, SourceError> {
        let table = self
            .tables
            .get(&def.source.table)
            .ok_or_else(|| SourceError::query(format!("no such table {}", def.source.table)))?;

        let mut rows = Vec::new();
        for record in table {
            let matches = def.source.constraints.iter().all(|(field, expected)| {
                record
                    .iter()
                    .find(|(name, _)| name == field)
                    .map(|(_, v)| v == expected)
                    .unwrap_or(false)
            });
            if !matches {
                continue;
            }

            let mut fields = Vec::with_capacity(def.source.columns.len());
            for column in &def.source.columns {
                let value = record
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                fields.push((column.clone(), value));
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

        if !def.source.order_by.is_empty() {
            let order_by = def.source.order_by.clone();
            rows.sort_by(|a, b| {
                for field in &order_by {
                    let left = a.source_value(field);
                    let right = b.source_value(field);
                    let ord = compare_values(left, right);
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        Ok(rows)
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        _ => std::cmp::Ordering::Equal,
    }
}

struct InMemoryRowStream {
    rows: std::vec::IntoIter<Row>,
}

#[async_trait]
impl RowStream for InMemoryRowStream {
    async fn fetch_next(&mut self) -> Result<Option<Row>, SourceError> {
        Ok(self.rows.next())
    }
}

#[async_trait]
impl SourceRowProvider for InMemorySourceProvider {
    async fn open(
        &self,
        def: &MigrationDefinition,
        offset: u64,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        let rows = self.build_rows(def)?;
        let rows: Vec<Row> = rows.into_iter().skip(offset as usize).collect();
        Ok(Box::new(InMemoryRowStream {
            rows: rows.into_iter(),
        }))
    }

    async fn detail(
        &self,
        table: &str,
        match_field: &str,
        key: &IdValue,
        value_field: &str,
    ) -> Result<Vec<Value>, SourceError> {
        let table = self
            .tables
            .get(table)
            .ok_or_else(|| SourceError::query(format!("no such table {table}")))?;
        let key_value = match key {
            IdValue::Int(n) => Value::from(*n),
            IdValue::Text(s) => Value::from(s.clone()),
        };
        let mut out = Vec::new();
        for record in table {
            let matches = record
                .iter()
                .find(|(name, _)| name == match_field)
                .map(|(_, v)| *v == key_value)
                .unwrap_or(false);
            if matches {
                if let Some((_, v)) = record.iter().find(|(name, _)| name == value_field) {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    async fn supports(&self, def: &MigrationDefinition) -> Result<bool, SourceError> {
        Ok(self.tables.contains_key(&def.source.table))
    }

    async fn distinct_values(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<Value>, SourceError> {
        let table = self
            .tables
            .get(table)
            .ok_or_else(|| SourceError::query(format!("no such table {table}")))?;
        let mut values: Vec<Value> = Vec::new();
        for record in table {
            if let Some((_, v)) = record.iter().find(|(name, _)| name == column) {
                if !v.is_null() && !values.contains(v) {
                    values.push(v.clone());
                }
            }
        }
        values.sort_by(|a, b| compare_values(Some(a), Some(b)));
        Ok(values)
    }

    async fn estimate(&self, def: &MigrationDefinition) -> Result<Option<u64>, SourceError> {
        Ok(Some(self.build_rows(def)?.len() as u64))
    }
}
