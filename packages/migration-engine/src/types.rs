//! Core identifier and scalar value types shared across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one concrete migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId(pub String);

impl MigrationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity assigned by the destination store when a row is written.
///
/// Destinations that generate their own keys return a fresh v7 UUID;
/// destinations with natural keys return them as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId(pub String);

impl DestinationId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared type of a source ID field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdValueKind {
    Int,
    Text,
}

/// One component of a row's identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Int(i64),
    Text(String),
}

impl IdValue {
    /// Coerce a JSON value into an ID component of the declared kind.
    ///
    /// Returns `None` when the value cannot represent an identity of
    /// that kind (null, objects, fractional numbers).
    pub fn coerce(value: &serde_json::Value, kind: IdValueKind) -> Option<Self> {
        match kind {
            IdValueKind::Int => match value {
                serde_json::Value::Number(n) => n.as_i64().map(IdValue::Int),
                serde_json::Value::String(s) => s.trim().parse::<i64>().ok().map(IdValue::Int),
                _ => None,
            },
            IdValueKind::Text => match value {
                serde_json::Value::String(s) => Some(IdValue::Text(s.clone())),
                serde_json::Value::Number(n) => Some(IdValue::Text(n.to_string())),
                _ => None,
            },
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(n) => write!(f, "{n}"),
            IdValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for IdValue {
    fn from(n: i64) -> Self {
        IdValue::Int(n)
    }
}

impl From<&str> for IdValue {
    fn from(s: &str) -> Self {
        IdValue::Text(s.to_string())
    }
}

/// Serialize an identity tuple into the stable string key used by the
/// ID map. Components are joined with `:`; a single-component tuple is
/// just its value (`"42"`, not `"42:"`).
pub fn source_key(ids: &[IdValue]) -> String {
    let mut out = String::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&id.to_string());
    }
    out
}

/// Status of an ID map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Row was written to the destination and the stored hash matches.
    Imported,
    /// Row was flagged for re-import on the next run.
    NeedsUpdate,
    /// Row failed destination validation on its last attempt.
    Failed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imported => "imported",
            Self::NeedsUpdate => "needs_update",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "needs_update" => Self::NeedsUpdate,
            "failed" => Self::Failed,
            _ => Self::Imported,
        }
    }
}
