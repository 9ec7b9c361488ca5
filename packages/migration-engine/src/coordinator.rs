//! Batch run coordination across bounded execution windows.
//!
//! The coordinator owns no wall-clock policy of its own: the caller
//! injects a time budget, and each [`BatchRunCoordinator::tick`]
//! processes migrations in dependency order until the budget expires
//! or the run finishes. Between ticks the caller persists
//! [`RunState`], which round-trips exactly through JSON so a resumed
//! run continues with the same remaining order and row cursor.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::destination::DestinationWriter;
use crate::error::RunError;
use crate::executor::{ExecutionProgress, MigrationExecutor, MigrationStatus};
use crate::id_map::IdMap;
use crate::registry::MigrationRegistry;
use crate::source::SourceRowProvider;
use crate::types::MigrationId;

/// Caller-supplied knobs for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Wall-clock budget per tick. `None` means run to completion in
    /// one tick.
    pub time_budget: Option<Duration>,
    pub dry_run: bool,
    /// Most-recent message count retained in the run log.
    pub log_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            time_budget: None,
            dry_run: false,
            log_capacity: 100,
        }
    }
}

/// Bounded message ring: keeps the most recent `capacity` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    capacity: usize,
    entries: VecDeque<String>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message.into());
    }

    /// Messages most recent first.
    pub fn recent(&self) -> Vec<String> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulated result for one migration across ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub id: MigrationId,
    pub status: MigrationStatus,
    pub imported: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped_rows: u64,
    pub failed_rows: u64,
}

impl MigrationOutcome {
    fn pending(id: MigrationId) -> Self {
        Self {
            id,
            status: MigrationStatus::Pending,
            imported: 0,
            updated: 0,
            unchanged: 0,
            skipped_rows: 0,
            failed_rows: 0,
        }
    }

    fn absorb(&mut self, progress: &ExecutionProgress) {
        self.status = progress.status;
        self.imported += progress.imported;
        self.updated += progress.updated;
        self.unchanged += progress.unchanged;
        self.skipped_rows += progress.skipped_rows;
        self.failed_rows += progress.failed_rows;
    }
}

/// Resumable state of one run. Persisted by the host between bounded
/// execution windows; all counters are monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Dependency-ordered migration ids, fixed for the whole run.
    order: Vec<MigrationId>,
    /// Index of the migration currently (or next) being processed.
    position: usize,
    /// Row cursor within the current migration.
    cursor: u64,
    outcomes: BTreeMap<MigrationId, MigrationOutcome>,
    successes: u64,
    failures: u64,
    processed_rows: u64,
    log: MessageLog,
    dry_run: bool,
}

impl RunState {
    fn new(order: Vec<MigrationId>, options: &RunOptions) -> Self {
        let outcomes = order
            .iter()
            .map(|id| (id.clone(), MigrationOutcome::pending(id.clone())))
            .collect();
        Self {
            order,
            position: 0,
            cursor: 0,
            outcomes,
            successes: 0,
            failures: 0,
            processed_rows: 0,
            log: MessageLog::new(options.log_capacity),
            dry_run: options.dry_run,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.order.len()
    }

    pub fn current(&self) -> Option<&MigrationId> {
        self.order.get(self.position)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn outcome(&self, id: &MigrationId) -> Option<&MigrationOutcome> {
        self.outcomes.get(id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, RunError> {
        serde_json::from_str(json).map_err(|e| RunError::InvalidState(e.to_string()))
    }

    /// Final report for the run so far. Always available, even after
    /// partial failure: the run never ends without one.
    pub fn report(&self) -> RunReport {
        RunReport {
            migrations: self
                .order
                .iter()
                .filter_map(|id| self.outcomes.get(id).cloned())
                .collect(),
            successes: self.successes,
            failures: self.failures,
            processed_rows: self.processed_rows,
            messages: self.log.recent(),
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Per-migration terminal states in run order.
    pub migrations: Vec<MigrationOutcome>,
    /// Migrations that completed.
    pub successes: u64,
    /// Migrations that failed.
    pub failures: u64,
    pub processed_rows: u64,
    /// Bounded log, most recent first.
    pub messages: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

/// Result of one bounded tick.
#[derive(Debug)]
pub enum RunTick {
    /// Run complete; nothing left to resume.
    Finished(RunReport),
    /// Time budget exhausted; persist the state and re-invoke later.
    Yielded,
}

/// Runs a dependency-ordered migration list across bounded ticks.
pub struct BatchRunCoordinator {
    source: Arc<dyn SourceRowProvider>,
    destination: Arc<dyn DestinationWriter>,
    id_map: Arc<dyn IdMap>,
    options: RunOptions,
}

impl BatchRunCoordinator {
    pub fn new(
        source: Arc<dyn SourceRowProvider>,
        destination: Arc<dyn DestinationWriter>,
        id_map: Arc<dyn IdMap>,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            destination,
            id_map,
            options,
        }
    }

    /// Begin a run over the requested migrations (plus transitive
    /// dependencies), dependency-ordered.
    ///
    /// Topology errors abort here, before any source row is read.
    pub fn start(
        &self,
        registry: &MigrationRegistry,
        requested: &[MigrationId],
    ) -> Result<RunState, RunError> {
        let ordered = registry.dependency_order(requested)?;
        let order: Vec<MigrationId> = ordered.into_iter().map(|d| d.id).collect();
        info!(migrations = order.len(), "run starting");
        Ok(RunState::new(order, &self.options))
    }

    /// Process migrations until the run finishes or the time budget
    /// expires. The state is left resumable in either case.
    pub async fn tick(
        &self,
        registry: &MigrationRegistry,
        state: &mut RunState,
    ) -> Result<RunTick, RunError> {
        let deadline = self.options.time_budget.map(|budget| Instant::now() + budget);
        let executor = MigrationExecutor::new(
            self.source.as_ref(),
            self.destination.as_ref(),
            self.id_map.as_ref(),
        )
        .dry_run(state.dry_run);

        while let Some(id) = state.current().cloned() {
            let def = registry.get(&id).ok_or_else(|| {
                RunError::InvalidState(format!("run state references unknown migration {id}"))
            })?;

            let resuming = state.cursor > 0;
            if !resuming {
                if !def.enabled {
                    self.finish_migration(state, &id, MigrationStatus::Disabled);
                    state.log.push(format!("{id}: disabled by configuration"));
                    continue;
                }

                if let Some(unmet) = self.unmet_dependency(state, def) {
                    self.finish_migration(state, &id, MigrationStatus::Skipped);
                    state
                        .log
                        .push(format!("{id}: skipped, prerequisite {unmet} did not complete"));
                    continue;
                }

                match self.source.supports(def).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finish_migration(state, &id, MigrationStatus::Skipped);
                        state
                            .log
                            .push(format!("{id}: skipped, source capability check failed"));
                        continue;
                    }
                    Err(err) => {
                        warn!(migration = %id, error = %err, "capability check failed");
                        self.finish_migration(state, &id, MigrationStatus::Failed);
                        state.failures += 1;
                        state.log.push(format!("{id}: {err}"));
                        continue;
                    }
                }
            }

            let progress = executor.execute(def, state.cursor, deadline).await;
            state.processed_rows += progress.processed;
            for message in &progress.messages {
                state.log.push(message.clone());
            }
            if let Some(outcome) = state.outcomes.get_mut(&id) {
                outcome.absorb(&progress);
            }

            match progress.status {
                MigrationStatus::Incomplete => {
                    state.cursor = progress.cursor;
                    info!(migration = %id, cursor = state.cursor, "yielding");
                    return Ok(RunTick::Yielded);
                }
                MigrationStatus::Completed => {
                    state.successes += 1;
                    self.advance(state);
                }
                MigrationStatus::Failed => {
                    state.failures += 1;
                    self.advance(state);
                }
                // The executor only returns the three states above.
                other => {
                    return Err(RunError::InvalidState(format!(
                        "executor returned non-terminal status {}",
                        other.as_str()
                    )));
                }
            }
        }

        let report = state.report();
        info!(
            successes = report.successes,
            failures = report.failures,
            rows = report.processed_rows,
            "run finished"
        );
        Ok(RunTick::Finished(report))
    }

    /// Drive ticks until the run finishes. Used where the caller has
    /// no external batch system to yield to.
    ///
    /// A tick that yields without moving the run forward stops the
    /// loop with `RunError::Stalled`: under a too-small budget every
    /// tick would yield at zero rows forever.
    pub async fn run_to_completion(
        &self,
        registry: &MigrationRegistry,
        requested: &[MigrationId],
    ) -> Result<RunReport, RunError> {
        let mut state = self.start(registry, requested)?;
        loop {
            let before = (state.position, state.cursor, state.processed_rows);
            match self.tick(registry, &mut state).await? {
                RunTick::Finished(report) => return Ok(report),
                RunTick::Yielded => {
                    if (state.position, state.cursor, state.processed_rows) == before {
                        return Err(RunError::Stalled);
                    }
                }
            }
        }
    }

    /// Roll back the requested migrations in reverse dependency order.
    pub async fn rollback(
        &self,
        registry: &MigrationRegistry,
        requested: &[MigrationId],
    ) -> Result<u64, RunError> {
        let ordered = registry.dependency_order(requested)?;
        let executor = MigrationExecutor::new(
            self.source.as_ref(),
            self.destination.as_ref(),
            self.id_map.as_ref(),
        );
        let mut removed = 0;
        for def in ordered.iter().rev() {
            match executor.rollback(def).await {
                Ok(count) => removed += count,
                Err(err) => warn!(migration = %def.id, error = %err, "rollback failed"),
            }
        }
        Ok(removed)
    }

    fn unmet_dependency<'d>(
        &self,
        state: &RunState,
        def: &'d crate::registry::MigrationDefinition,
    ) -> Option<&'d MigrationId> {
        def.dependencies.iter().find(|dep| {
            state
                .outcomes
                .get(dep)
                .map(|o| o.status != MigrationStatus::Completed)
                .unwrap_or(true)
        })
    }

    fn finish_migration(&self, state: &mut RunState, id: &MigrationId, status: MigrationStatus) {
        if let Some(outcome) = state.outcomes.get_mut(id) {
            outcome.status = status;
        }
        self.advance(state);
    }

    fn advance(&self, state: &mut RunState) {
        state.position += 1;
        state.cursor = 0;
    }
}
