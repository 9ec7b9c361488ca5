//! Persistent source-to-destination identity mapping.
//!
//! The ID map is what makes re-runs idempotent and rollbacks possible:
//! every successfully written row leaves an entry keyed by
//! (migration id, source key) carrying the destination identity, the
//! row hash at import time, and a status.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{DestinationId, MigrationId, RowStatus};

/// One persistent mapping record.
///
/// At most one entry exists per (migration, source_key) pair; `save`
/// is an upsert with last-writer-wins semantics. Entries are only ever
/// removed by an explicit rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMapEntry {
    pub migration: MigrationId,
    pub source_key: String,
    /// Absent for rows that failed before a destination identity was
    /// assigned.
    pub destination: Option<DestinationId>,
    pub row_hash: String,
    pub status: RowStatus,
    pub imported_at: DateTime<Utc>,
}

impl IdMapEntry {
    pub fn imported(
        migration: MigrationId,
        source_key: String,
        destination: DestinationId,
        row_hash: String,
    ) -> Self {
        Self {
            migration,
            source_key,
            destination: Some(destination),
            row_hash,
            status: RowStatus::Imported,
            imported_at: Utc::now(),
        }
    }

    pub fn failed(migration: MigrationId, source_key: String, row_hash: String) -> Self {
        Self {
            migration,
            source_key,
            destination: None,
            row_hash,
            status: RowStatus::Failed,
            imported_at: Utc::now(),
        }
    }
}

/// Storage seam for ID map entries.
///
/// Execution is single-threaded per migration, so implementations only
/// need upsert semantics, not optimistic concurrency.
#[async_trait]
pub trait IdMap: Send + Sync {
    async fn lookup(
        &self,
        migration: &MigrationId,
        source_key: &str,
    ) -> Result<Option<IdMapEntry>>;

    /// Upsert an entry; last writer wins.
    async fn save(&self, entry: IdMapEntry) -> Result<()>;

    /// All entries for one migration, used by rollback to find the
    /// destination records to delete.
    async fn entries(&self, migration: &MigrationId) -> Result<Vec<IdMapEntry>>;

    /// Remove every entry for the migration. Returns the removed count.
    async fn rollback(&self, migration: &MigrationId) -> Result<u64>;

    /// Number of entries recorded for the migration.
    async fn processed_count(&self, migration: &MigrationId) -> Result<u64>;
}

/// In-memory ID map. The default for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryIdMap {
    entries: RwLock<HashMap<(MigrationId, String), IdMapEntry>>,
}

impl InMemoryIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries for one migration, for inspection in tests.
    pub async fn entries_for(&self, migration: &MigrationId) -> Vec<IdMapEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| &e.migration == migration)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IdMap for InMemoryIdMap {
    async fn lookup(
        &self,
        migration: &MigrationId,
        source_key: &str,
    ) -> Result<Option<IdMapEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(migration.clone(), source_key.to_string()))
            .cloned())
    }

    async fn save(&self, entry: IdMapEntry) -> Result<()> {
        self.entries.write().await.insert(
            (entry.migration.clone(), entry.source_key.clone()),
            entry,
        );
        Ok(())
    }

    async fn entries(&self, migration: &MigrationId) -> Result<Vec<IdMapEntry>> {
        Ok(self.entries_for(migration).await)
    }

    async fn rollback(&self, migration: &MigrationId) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(m, _), _| m != migration);
        Ok((before - entries.len()) as u64)
    }

    async fn processed_count(&self, migration: &MigrationId) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|(m, _)| m == migration)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(migration: &str, key: &str, hash: &str) -> IdMapEntry {
        IdMapEntry::imported(
            MigrationId::from(migration),
            key.to_string(),
            DestinationId::new(format!("dest-{key}")),
            hash.to_string(),
        )
    }

    #[tokio::test]
    async fn save_then_lookup() {
        let map = InMemoryIdMap::new();
        map.save(entry("users", "1", "h1")).await.unwrap();

        let found = map
            .lookup(&MigrationId::from("users"), "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.destination.unwrap().as_str(), "dest-1");
        assert_eq!(found.status, RowStatus::Imported);

        assert!(map
            .lookup(&MigrationId::from("users"), "2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn save_is_last_writer_wins() {
        let map = InMemoryIdMap::new();
        map.save(entry("users", "1", "h1")).await.unwrap();
        map.save(entry("users", "1", "h2")).await.unwrap();

        let found = map
            .lookup(&MigrationId::from("users"), "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.row_hash, "h2");
        assert_eq!(
            map.processed_count(&MigrationId::from("users")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn rollback_removes_only_that_migration() {
        let map = InMemoryIdMap::new();
        map.save(entry("users", "1", "h1")).await.unwrap();
        map.save(entry("users", "2", "h2")).await.unwrap();
        map.save(entry("nodes", "1", "h3")).await.unwrap();

        let removed = map.rollback(&MigrationId::from("users")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            map.processed_count(&MigrationId::from("nodes")).await.unwrap(),
            1
        );
        assert!(map
            .lookup(&MigrationId::from("users"), "1")
            .await
            .unwrap()
            .is_none());
    }
}
