//! Declarative field-level row transformation.
//!
//! A migration's destination spec carries a list of [`FieldMapping`]s.
//! Each mapping reads one source field, pushes its value through a
//! small step pipeline, and writes the result to a destination field.
//! The transformer never throws for flow control: a row that should
//! not be migrated comes back as [`TransformOutcome::Skip`], which the
//! executor counts separately from failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::SourceError;
use crate::id_map::IdMap;
use crate::registry::MigrationDefinition;
use crate::row::Row;
use crate::source::SourceRowProvider;
use crate::types::{IdValue, MigrationId};

/// One step in a field's transformation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformStep {
    /// Pass the value through unchanged. Implicit for mappings with no
    /// steps; listed explicitly only for readability in manifests.
    Copy,

    /// Split a delimited string into an array of trimmed pieces.
    /// Empty pieces are dropped; non-string input becomes an empty
    /// array.
    Split { delimiter: String },

    /// Invert a 0/1 flag. Covers sources whose polarity disagrees
    /// with the destination ("0 means published" vs "1 means
    /// published").
    InvertFlag,

    /// Substitute a literal when the value is null or absent.
    Default { value: Value },

    /// Resolve the value through a previously-run migration's ID map.
    /// A missing parent skips the row when `required`, otherwise maps
    /// to null.
    Lookup {
        migration: MigrationId,
        #[serde(default)]
        required: bool,
    },

    /// Collect a one-to-many detail from the source: the values of
    /// `value_field` in `table` where `match_field` equals the current
    /// value (e.g. a node's taxonomy term ids).
    Detail {
        table: String,
        match_field: String,
        value_field: String,
    },
}

/// Maps one source field to one destination field through a step
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub destination_field: String,
    #[serde(default)]
    pub steps: Vec<TransformStep>,
}

impl FieldMapping {
    /// A plain copy mapping.
    pub fn copy(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source_field: source.into(),
            destination_field: destination.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: TransformStep) -> Self {
        self.steps.push(step);
        self
    }
}

/// Result of transforming one row.
#[derive(Debug)]
pub enum TransformOutcome {
    /// Row is ready for the destination writer.
    Row(Row),
    /// Row was deliberately not migrated. Not an error.
    Skip { reason: String },
}

/// Infrastructure failures during transformation. These are
/// migration-scoped: the executor folds them into a failed migration.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("id map error: {0}")]
    IdMap(#[from] anyhow::Error),
}

/// Read-only collaborators available to transform steps.
pub struct TransformContext<'a> {
    pub id_map: &'a dyn IdMap,
    pub source: &'a dyn SourceRowProvider,
}

/// Apply the definition's field mappings to a row.
pub async fn transform(
    def: &MigrationDefinition,
    mut row: Row,
    ctx: &TransformContext<'_>,
) -> Result<TransformOutcome, TransformError> {
    'mappings: for mapping in &def.destination.mappings {
        let mut current = row
            .source_value(&mapping.source_field)
            .cloned()
            .unwrap_or(Value::Null);

        for step in &mapping.steps {
            current = match step {
                TransformStep::Copy => current,
                TransformStep::Split { delimiter } => split_value(&current, delimiter),
                TransformStep::InvertFlag => invert_flag(&current),
                TransformStep::Default { value } => {
                    if current.is_null() {
                        value.clone()
                    } else {
                        current
                    }
                }
                TransformStep::Lookup {
                    migration,
                    required,
                } => {
                    match lookup_value(&current, migration, ctx).await? {
                        Some(resolved) => resolved,
                        None if *required => {
                            return Ok(TransformOutcome::Skip {
                                reason: format!(
                                    "row {}: required reference via {migration} not yet migrated (value {current})",
                                    row.source_key()
                                ),
                            });
                        }
                        None => Value::Null,
                    }
                }
                TransformStep::Detail {
                    table,
                    match_field,
                    value_field,
                } => {
                    let key = match coerce_id(&current) {
                        Some(key) => key,
                        None => {
                            // No usable key means no detail rows.
                            row.set_destination(
                                &mapping.destination_field,
                                Value::Array(Vec::new()),
                            );
                            continue 'mappings;
                        }
                    };
                    let values = ctx
                        .source
                        .detail(table, match_field, &key, value_field)
                        .await?;
                    Value::Array(values)
                }
            };
        }

        row.set_destination(&mapping.destination_field, current);
    }

    Ok(TransformOutcome::Row(row))
}

fn split_value(value: &Value, delimiter: &str) -> Value {
    match value {
        Value::String(s) => Value::Array(
            s.split(delimiter)
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(|piece| Value::String(piece.to_string()))
                .collect(),
        ),
        _ => Value::Array(Vec::new()),
    }
}

fn invert_flag(value: &Value) -> Value {
    let truthy = match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    Value::from(if truthy { 0 } else { 1 })
}

fn coerce_id(value: &Value) -> Option<IdValue> {
    match value {
        Value::Number(n) => n.as_i64().map(IdValue::Int),
        Value::String(s) => Some(IdValue::Text(s.clone())),
        _ => None,
    }
}

async fn lookup_value(
    value: &Value,
    migration: &MigrationId,
    ctx: &TransformContext<'_>,
) -> Result<Option<Value>, TransformError> {
    let Some(key) = coerce_id(value) else {
        return Ok(None);
    };
    let entry = ctx.id_map.lookup(migration, &key.to_string()).await?;
    Ok(entry
        .and_then(|e| e.destination)
        .map(|dest| Value::String(dest.0)))
}
