//! Destination writer seam and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WriteError;
use crate::row::Row;
use crate::types::DestinationId;

/// Opaque sink that turns a transformed row into a persisted record
/// and returns its destination identity.
///
/// The error split is the executor's failure-isolation contract:
/// `WriteError::Validation` is a per-row failure and the migration
/// continues; `WriteError::Fatal` aborts the migration's remaining
/// rows.
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Write one row to `target`. `existing` carries the destination
    /// identity from a previous import when the row is being
    /// re-imported, so writers can update instead of insert.
    async fn write(
        &self,
        target: &str,
        row: &Row,
        existing: Option<&DestinationId>,
    ) -> Result<DestinationId, WriteError>;

    /// Remove a previously written record during rollback. Best
    /// effort; unknown identities are ignored.
    async fn delete(&self, target: &str, id: &DestinationId) -> Result<(), WriteError>;
}

/// A record captured by the in-memory destination.
#[derive(Debug, Clone)]
pub struct WrittenRecord {
    pub id: DestinationId,
    pub fields: Vec<(String, Value)>,
}

/// In-memory destination used by tests and dry validation.
///
/// Failures are scriptable per source key so tests can exercise the
/// per-row isolation and fatal-abort paths.
#[derive(Debug, Default)]
pub struct InMemoryDestination {
    records: Mutex<HashMap<String, Vec<WrittenRecord>>>,
    validation_failures: Mutex<Vec<String>>,
    fatal_after: Mutex<Option<u64>>,
    writes: Mutex<u64>,
}

impl InMemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes for the given source key fail validation.
    pub fn fail_validation_for(&self, source_key: impl Into<String>) {
        self.validation_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source_key.into());
    }

    /// Make every write after the first `n` return a fatal error, as a
    /// destination that goes away mid-migration would.
    pub fn fail_fatally_after(&self, n: u64) {
        *self.fatal_after.lock().unwrap_or_else(|e| e.into_inner()) = Some(n);
    }

    /// Records written to `target`, in write order.
    pub fn records(&self, target: &str) -> Vec<WrittenRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Total write calls that succeeded.
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DestinationWriter for InMemoryDestination {
    async fn write(
        &self,
        target: &str,
        row: &Row,
        existing: Option<&DestinationId>,
    ) -> Result<DestinationId, WriteError> {
        let key = row.source_key();
        if self
            .validation_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
        {
            return Err(WriteError::validation(format!(
                "row {key} rejected by destination"
            )));
        }
        {
            let writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
            let fatal_after = self.fatal_after.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(limit) = *fatal_after {
                if *writes >= limit {
                    return Err(WriteError::fatal("destination unreachable"));
                }
            }
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = records.entry(target.to_string()).or_default();
        let id = match existing {
            Some(id) => {
                // Re-import: replace the earlier record in place.
                if let Some(slot) = bucket.iter_mut().find(|r| r.id == *id) {
                    slot.fields = row.destination_fields().to_vec();
                }
                id.clone()
            }
            None => {
                let id = DestinationId::generate();
                bucket.push(WrittenRecord {
                    id: id.clone(),
                    fields: row.destination_fields().to_vec(),
                });
                id
            }
        };
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(id)
    }

    async fn delete(&self, target: &str, id: &DestinationId) -> Result<(), WriteError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = records.get_mut(target) {
            bucket.retain(|r| r.id != *id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdValue;
    use serde_json::json;

    fn row(uid: i64, name: &str) -> Row {
        let mut row = Row::new(
            vec![IdValue::Int(uid)],
            vec![("uid".into(), json!(uid)), ("name".into(), json!(name))],
        );
        row.set_destination("username", json!(name));
        row
    }

    #[tokio::test]
    async fn write_assigns_identity_and_records_fields() {
        let dest = InMemoryDestination::new();
        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();

        let records = dest.records("users");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].fields, vec![("username".into(), json!("alice"))]);
    }

    #[tokio::test]
    async fn existing_identity_updates_in_place() {
        let dest = InMemoryDestination::new();
        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();
        let id2 = dest
            .write("users", &row(1, "alicia"), Some(&id))
            .await
            .unwrap();

        assert_eq!(id, id2);
        let records = dest.records("users");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields[0].1, json!("alicia"));
    }

    #[tokio::test]
    async fn scripted_failures() {
        let dest = InMemoryDestination::new();
        dest.fail_validation_for("1");
        let err = dest.write("users", &row(1, "alice"), None).await.unwrap_err();
        assert!(matches!(err, WriteError::Validation { .. }));

        dest.fail_fatally_after(0);
        let err = dest.write("users", &row(2, "bob"), None).await.unwrap_err();
        assert!(matches!(err, WriteError::Fatal { .. }));
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dest = InMemoryDestination::new();
        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();
        dest.delete("users", &id).await.unwrap();
        assert!(dest.records("users").is_empty());
    }
}
