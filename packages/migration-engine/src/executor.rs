//! Per-migration execution: pull, transform, write, record.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::destination::DestinationWriter;
use crate::error::WriteError;
use crate::id_map::{IdMap, IdMapEntry};
use crate::registry::MigrationDefinition;
use crate::source::SourceRowProvider;
use crate::transform::{transform, TransformContext, TransformOutcome};
use crate::types::RowStatus;

/// Lifecycle states of one migration within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Not yet started.
    Pending,
    /// Currently pulling rows.
    Running,
    /// All rows processed with no fatal error.
    Completed,
    /// Interrupted by the time budget; resumable from the saved cursor.
    Incomplete,
    /// Aborted by an unrecoverable source or destination fault.
    Failed,
    /// Bypassed: prerequisite unmet or source capability check failed.
    Skipped,
    /// Excluded from the run by configuration.
    Disabled,
}

impl MigrationStatus {
    /// Whether the migration has reached a state it will not leave
    /// within this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Disabled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
        }
    }
}

/// What one `execute` call did, and where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub status: MigrationStatus,
    /// Rows written for the first time.
    pub imported: u64,
    /// Rows re-written because their hash or status demanded it.
    pub updated: u64,
    /// Rows skipped as unchanged (hash match).
    pub unchanged: u64,
    /// Rows the transformer asked to skip.
    pub skipped_rows: u64,
    /// Rows that failed destination validation.
    pub failed_rows: u64,
    /// Rows consumed from the stream by this call.
    pub processed: u64,
    /// Absolute offset into the source order after this call; the
    /// resume point for an `Incomplete` migration.
    pub cursor: u64,
    /// Human-readable notes, most recent last.
    pub messages: Vec<String>,
}

impl ExecutionProgress {
    fn new(status: MigrationStatus, cursor: u64) -> Self {
        Self {
            status,
            imported: 0,
            updated: 0,
            unchanged: 0,
            skipped_rows: 0,
            failed_rows: 0,
            processed: 0,
            cursor,
            messages: Vec::new(),
        }
    }

    fn note(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }
}

/// Drives one migration end-to-end against the three external seams.
///
/// Per-row policy (the failure-isolation contract): a transform skip
/// or a validation error is counted and the migration continues; a
/// fatal write or source error aborts the remaining rows of this
/// migration only.
pub struct MigrationExecutor<'a> {
    source: &'a dyn SourceRowProvider,
    destination: &'a dyn DestinationWriter,
    id_map: &'a dyn IdMap,
    dry_run: bool,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(
        source: &'a dyn SourceRowProvider,
        destination: &'a dyn DestinationWriter,
        id_map: &'a dyn IdMap,
    ) -> Self {
        Self {
            source,
            destination,
            id_map,
            dry_run: false,
        }
    }

    /// Run the full pipeline but suppress destination writes and ID
    /// map saves; counters report what would have happened.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Execute `def` starting at `cursor` rows into the source order,
    /// yielding `Incomplete` if `deadline` passes between rows.
    ///
    /// Never returns an error: source and destination faults fold into
    /// a `Failed` status with a message, so migration-scoped errors
    /// cannot escape into the run loop.
    pub async fn execute(
        &self,
        def: &MigrationDefinition,
        cursor: u64,
        deadline: Option<Instant>,
    ) -> ExecutionProgress {
        let mut progress = ExecutionProgress::new(MigrationStatus::Running, cursor);
        info!(migration = %def.id, cursor, dry_run = self.dry_run, "starting migration");

        let mut stream = match self.source.open(def, cursor).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(migration = %def.id, error = %err, "source open failed");
                progress.status = MigrationStatus::Failed;
                progress.note(format!("{}: {err}", def.id));
                return progress;
            }
        };

        loop {
            // Suspension point: only between rows, never mid-row.
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    debug!(migration = %def.id, cursor = progress.cursor, "time budget exceeded");
                    progress.status = MigrationStatus::Incomplete;
                    return progress;
                }
            }

            let row = match stream.fetch_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    warn!(migration = %def.id, error = %err, "source fetch failed");
                    progress.status = MigrationStatus::Failed;
                    progress.note(format!("{}: {err}", def.id));
                    return progress;
                }
            };

            let source_key = row.source_key();
            let row_hash = row.hash();

            let existing = match self.id_map.lookup(&def.id, &source_key).await {
                Ok(existing) => existing,
                Err(err) => {
                    progress.status = MigrationStatus::Failed;
                    progress.note(format!("{}: id map lookup failed: {err}", def.id));
                    return progress;
                }
            };

            // Idempotence: an imported row whose hash still matches
            // needs no write.
            if let Some(entry) = &existing {
                if entry.status == RowStatus::Imported && entry.row_hash == row_hash {
                    progress.unchanged += 1;
                    progress.processed += 1;
                    progress.cursor += 1;
                    continue;
                }
            }

            let ctx = TransformContext {
                id_map: self.id_map,
                source: self.source,
            };
            let transformed = match transform(def, row, &ctx).await {
                Ok(TransformOutcome::Row(row)) => row,
                Ok(TransformOutcome::Skip { reason }) => {
                    debug!(migration = %def.id, row = %source_key, %reason, "row skipped");
                    progress.skipped_rows += 1;
                    progress.processed += 1;
                    progress.cursor += 1;
                    progress.note(format!("{}: skipped row {source_key}: {reason}", def.id));
                    continue;
                }
                Err(err) => {
                    warn!(migration = %def.id, error = %err, "transform failed");
                    progress.status = MigrationStatus::Failed;
                    progress.note(format!("{}: {err}", def.id));
                    return progress;
                }
            };

            let is_update = existing.is_some();
            if self.dry_run {
                if is_update {
                    progress.updated += 1;
                } else {
                    progress.imported += 1;
                }
                progress.processed += 1;
                progress.cursor += 1;
                continue;
            }

            let existing_dest = existing.as_ref().and_then(|e| e.destination.as_ref());
            match self
                .destination
                .write(&def.destination.target, &transformed, existing_dest)
                .await
            {
                Ok(dest_id) => {
                    let entry = IdMapEntry::imported(
                        def.id.clone(),
                        source_key.clone(),
                        dest_id,
                        row_hash,
                    );
                    if let Err(err) = self.id_map.save(entry).await {
                        progress.status = MigrationStatus::Failed;
                        progress.note(format!("{}: id map save failed: {err}", def.id));
                        return progress;
                    }
                    if is_update {
                        progress.updated += 1;
                    } else {
                        progress.imported += 1;
                    }
                }
                Err(WriteError::Validation { message }) => {
                    warn!(migration = %def.id, row = %source_key, %message, "row failed validation");
                    progress.failed_rows += 1;
                    progress.note(format!("{}: row {source_key}: {message}", def.id));
                    let entry = IdMapEntry::failed(def.id.clone(), source_key.clone(), row_hash);
                    if let Err(err) = self.id_map.save(entry).await {
                        progress.status = MigrationStatus::Failed;
                        progress.note(format!("{}: id map save failed: {err}", def.id));
                        return progress;
                    }
                }
                Err(WriteError::Fatal { message }) => {
                    warn!(migration = %def.id, %message, "fatal write error");
                    progress.status = MigrationStatus::Failed;
                    progress.note(format!("{}: {message}", def.id));
                    return progress;
                }
            }

            // The cursor only moves once the row's outcome is durable.
            progress.processed += 1;
            progress.cursor += 1;
        }

        progress.status = MigrationStatus::Completed;
        info!(
            migration = %def.id,
            imported = progress.imported,
            updated = progress.updated,
            unchanged = progress.unchanged,
            skipped = progress.skipped_rows,
            failed = progress.failed_rows,
            "migration completed"
        );
        progress
    }

    /// Roll back one migration: delete its destination records and
    /// clear its ID map entries. Returns the number of map entries
    /// removed.
    pub async fn rollback(&self, def: &MigrationDefinition) -> anyhow::Result<u64> {
        // Destination deletes happen before the map is cleared so a
        // crash mid-rollback leaves entries to retry against.
        let entries = self.id_map.entries(&def.id).await?;
        info!(migration = %def.id, entries = entries.len(), "rolling back");
        for entry in &entries {
            if let Some(dest) = &entry.destination {
                if let Err(err) = self
                    .destination
                    .delete(&def.destination.target, dest)
                    .await
                {
                    warn!(migration = %def.id, row = %entry.source_key, error = %err, "rollback delete failed");
                }
            }
        }
        let removed = self.id_map.rollback(&def.id).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::InMemoryDestination;
    use crate::id_map::InMemoryIdMap;
    use crate::registry::{DestinationSpec, IdField, SourceSpec};
    use crate::source::InMemorySourceProvider;
    use crate::transform::FieldMapping;
    use crate::types::MigrationId;
    use serde_json::json;

    fn users_def() -> MigrationDefinition {
        MigrationDefinition {
            id: MigrationId::from("users"),
            source_tags: Vec::new(),
            source: SourceSpec::new("users", vec!["uid".into(), "name".into()]),
            ids: vec![IdField::int("uid")],
            destination: DestinationSpec {
                target: "users".into(),
                mappings: vec![FieldMapping::copy("name", "username")],
            },
            dependencies: Vec::new(),
            enabled: true,
        }
    }

    fn users_source() -> InMemorySourceProvider {
        InMemorySourceProvider::new().with_table(
            "users",
            vec![
                vec![("uid".into(), json!(1)), ("name".into(), json!("alice"))],
                vec![("uid".into(), json!(2)), ("name".into(), json!("bob"))],
                vec![("uid".into(), json!(3)), ("name".into(), json!("carol"))],
            ],
        )
    }

    #[tokio::test]
    async fn completes_and_records_id_map_entries() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Completed);
        assert_eq!(progress.imported, 3);
        assert_eq!(progress.cursor, 3);
        assert_eq!(destination.records("users").len(), 3);
        assert_eq!(
            id_map
                .processed_count(&MigrationId::from("users"))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        executor.execute(&users_def(), 0, None).await;
        let writes_after_first = destination.write_count();

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Completed);
        assert_eq!(progress.unchanged, 3);
        assert_eq!(progress.imported, 0);
        assert_eq!(destination.write_count(), writes_after_first);
    }

    #[tokio::test]
    async fn changed_row_is_rewritten_as_update() {
        let mut source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);
        executor.execute(&users_def(), 0, None).await;

        source.insert_table(
            "users",
            vec![
                vec![("uid".into(), json!(1)), ("name".into(), json!("alicia"))],
                vec![("uid".into(), json!(2)), ("name".into(), json!("bob"))],
                vec![("uid".into(), json!(3)), ("name".into(), json!("carol"))],
            ],
        );
        let executor = MigrationExecutor::new(&source, &destination, &id_map);
        let progress = executor.execute(&users_def(), 0, None).await;

        assert_eq!(progress.updated, 1);
        assert_eq!(progress.unchanged, 2);
        // Updated in place, not duplicated.
        assert_eq!(destination.records("users").len(), 3);
    }

    #[tokio::test]
    async fn validation_failure_is_per_row() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        destination.fail_validation_for("2");
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Completed);
        assert_eq!(progress.imported, 2);
        assert_eq!(progress.failed_rows, 1);
        assert_eq!(destination.records("users").len(), 2);

        let entry = id_map
            .lookup(&MigrationId::from("users"), "2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RowStatus::Failed);
    }

    #[tokio::test]
    async fn fatal_write_aborts_the_migration() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        destination.fail_fatally_after(1);
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Failed);
        // The committed row survives the abort.
        assert_eq!(progress.imported, 1);
        assert_eq!(destination.records("users").len(), 1);
    }

    #[tokio::test]
    async fn source_error_fails_the_migration() {
        let source = InMemorySourceProvider::new();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Failed);
        assert!(progress.messages[0].contains("no such table"));
    }

    #[tokio::test]
    async fn expired_deadline_yields_incomplete_without_consuming_rows() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        let past = Instant::now() - std::time::Duration::from_millis(1);
        let progress = executor.execute(&users_def(), 0, Some(past)).await;
        assert_eq!(progress.status, MigrationStatus::Incomplete);
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.cursor, 0);

        // Resuming from the saved cursor finishes the job.
        let progress = executor.execute(&users_def(), progress.cursor, None).await;
        assert_eq!(progress.status, MigrationStatus::Completed);
        assert_eq!(progress.imported, 3);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map).dry_run(true);

        let progress = executor.execute(&users_def(), 0, None).await;
        assert_eq!(progress.status, MigrationStatus::Completed);
        assert_eq!(progress.imported, 3);
        assert_eq!(destination.write_count(), 0);
        assert_eq!(
            id_map
                .processed_count(&MigrationId::from("users"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn rollback_clears_the_id_map() {
        let source = users_source();
        let destination = InMemoryDestination::new();
        let id_map = InMemoryIdMap::new();
        let executor = MigrationExecutor::new(&source, &destination, &id_map);

        executor.execute(&users_def(), 0, None).await;
        let removed = executor.rollback(&users_def()).await.unwrap();
        assert_eq!(removed, 3);
        assert!(destination.records("users").is_empty());
        assert_eq!(
            id_map
                .processed_count(&MigrationId::from("users"))
                .await
                .unwrap(),
            0
        );
    }
}
