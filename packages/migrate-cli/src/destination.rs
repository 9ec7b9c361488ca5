//! JSON-lines destination writer.
//!
//! Each migrated row becomes one JSON object appended to
//! `<output_dir>/<target>.jsonl`, carrying its assigned destination
//! identity in `_id`. Re-imports and rollbacks rewrite the affected
//! file; these files are working artifacts for the importing system,
//! not a database.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use migration_engine::{DestinationId, DestinationWriter, Row, WriteError};
use serde_json::{Map, Value};

pub struct JsonLinesDestination {
    output_dir: PathBuf,
    // One writer at a time; execution is serial anyway, the lock just
    // keeps the rewrite paths honest.
    lock: Mutex<()>,
}

impl JsonLinesDestination {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn target_path(&self, target: &str) -> Result<PathBuf, WriteError> {
        let safe = target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !safe || target.is_empty() {
            return Err(WriteError::fatal(format!("unusable target name {target:?}")));
        }
        Ok(self.output_dir.join(format!("{target}.jsonl")))
    }

    fn record_object(row: &Row, id: &DestinationId) -> Result<Value, WriteError> {
        if row.destination_fields().is_empty() {
            return Err(WriteError::validation(format!(
                "row {} produced no destination fields",
                row.source_key()
            )));
        }
        let mut object = Map::new();
        object.insert("_id".to_string(), Value::String(id.to_string()));
        for (field, value) in row.destination_fields() {
            object.insert(field.clone(), value.clone());
        }
        Ok(Value::Object(object))
    }

    fn rewrite<F>(&self, target: &str, mut keep: F) -> Result<(), WriteError>
    where
        F: FnMut(&Value) -> bool,
    {
        let path = self.target_path(target)?;
        let Ok(contents) = fs::read_to_string(&path) else {
            return Ok(());
        };
        let mut kept = String::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)
                .map_err(|e| WriteError::fatal(format!("corrupt output file {path:?}: {e}")))?;
            if keep(&value) {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        fs::write(&path, kept).map_err(|e| WriteError::fatal(e.to_string()))
    }
}

#[async_trait]
impl DestinationWriter for JsonLinesDestination {
    async fn write(
        &self,
        target: &str,
        row: &Row,
        existing: Option<&DestinationId>,
    ) -> Result<DestinationId, WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.output_dir).map_err(|e| WriteError::fatal(e.to_string()))?;
        let path = self.target_path(target)?;

        match existing {
            Some(id) => {
                // Re-import: drop the old record, append the new one.
                let old = id.to_string();
                self.rewrite(target, |value| {
                    value.get("_id").and_then(Value::as_str) != Some(old.as_str())
                })?;
                let record = Self::record_object(row, id)?;
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| WriteError::fatal(e.to_string()))?;
                writeln!(file, "{record}").map_err(|e| WriteError::fatal(e.to_string()))?;
                Ok(id.clone())
            }
            None => {
                let id = DestinationId::generate();
                let record = Self::record_object(row, &id)?;
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|e| WriteError::fatal(e.to_string()))?;
                writeln!(file, "{record}").map_err(|e| WriteError::fatal(e.to_string()))?;
                Ok(id)
            }
        }
    }

    async fn delete(&self, target: &str, id: &DestinationId) -> Result<(), WriteError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let wanted = id.to_string();
        self.rewrite(target, |value| {
            value.get("_id").and_then(Value::as_str) != Some(wanted.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration_engine::IdValue;
    use serde_json::json;

    fn row(uid: i64, name: &str) -> Row {
        let mut row = Row::new(
            vec![IdValue::Int(uid)],
            vec![("uid".into(), json!(uid)), ("name".into(), json!(name))],
        );
        row.set_destination("username", json!(name));
        row
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "migrate-cli-test-{tag}-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn writes_one_json_line_per_row() {
        let dir = temp_dir("write");
        let dest = JsonLinesDestination::new(&dir);

        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();
        dest.write("users", &row(2, "bob"), None).await.unwrap();

        let contents = fs::read_to_string(dir.join("users.jsonl")).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["_id"], json!(id.to_string()));
        assert_eq!(lines[0]["username"], json!("alice"));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn reimport_replaces_the_old_record() {
        let dir = temp_dir("reimport");
        let dest = JsonLinesDestination::new(&dir);

        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();
        dest.write("users", &row(1, "alicia"), Some(&id)).await.unwrap();

        let contents = fs::read_to_string(dir.join("users.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("alicia"));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let dir = temp_dir("delete");
        let dest = JsonLinesDestination::new(&dir);

        let id = dest.write("users", &row(1, "alice"), None).await.unwrap();
        dest.write("users", &row(2, "bob"), None).await.unwrap();
        dest.delete("users", &id).await.unwrap();

        let contents = fs::read_to_string(dir.join("users.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("bob"));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn row_without_destination_fields_fails_validation() {
        let dir = temp_dir("validation");
        let dest = JsonLinesDestination::new(&dir);
        let bare = Row::new(vec![IdValue::Int(1)], vec![("uid".into(), json!(1))]);

        let err = dest.write("users", &bare, None).await.unwrap_err();
        assert!(matches!(err, WriteError::Validation { .. }));
        fs::remove_dir_all(dir).ok();
    }
}
