//! Batched, resumable ETL migration engine.
//!
//! The pipeline moves rows from a legacy source store into a new
//! destination through six cooperating parts:
//!
//! ```text
//! Registry ─orders─▶ Coordinator ─drives─▶ Executor
//!                                             │ pulls     Source
//!                                             │ maps      Transformer
//!                                             │ writes    Destination
//!                                             └─records─▶ ID map
//! ```
//!
//! Execution is single-threaded and cooperative: the coordinator
//! processes one migration at a time in dependency order, yielding
//! between rows whenever an injected time budget expires, and the
//! serialized [`RunState`] lets the host resume exactly where the
//! previous window stopped. The ID map makes re-runs idempotent:
//! unchanged rows (by content hash) are recognized and skipped.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = MigrationRegistry::new();
//! registry.register(users_definition)?;
//!
//! let coordinator = BatchRunCoordinator::new(
//!     Arc::new(source),
//!     Arc::new(destination),
//!     Arc::new(InMemoryIdMap::new()),
//!     RunOptions::default(),
//! );
//! let report = coordinator.run_to_completion(&registry, &ids).await?;
//! ```

pub mod coordinator;
pub mod destination;
pub mod error;
pub mod executor;
pub mod id_map;
pub mod registry;
pub mod row;
pub mod source;
pub mod sql;
pub mod transform;
pub mod types;

pub use coordinator::{
    BatchRunCoordinator, MessageLog, MigrationOutcome, RunOptions, RunReport, RunState, RunTick,
};
pub use destination::{DestinationWriter, InMemoryDestination, WrittenRecord};
pub use error::{RegistryError, RunError, SourceError, WriteError};
pub use executor::{ExecutionProgress, MigrationExecutor, MigrationStatus};
pub use id_map::{IdMap, IdMapEntry, InMemoryIdMap};
pub use registry::{
    DestinationSpec, FanOut, IdField, MigrationDefinition, MigrationRegistry, MigrationTemplate,
    SourceSpec, TemplateVariant,
};
pub use row::Row;
pub use source::{InMemorySourceProvider, RowStream, SourceRowProvider};
pub use sql::{PgIdMap, SqlSourceProvider};
pub use transform::{FieldMapping, TransformContext, TransformOutcome, TransformStep};
pub use types::{DestinationId, IdValue, IdValueKind, MigrationId, RowStatus};
