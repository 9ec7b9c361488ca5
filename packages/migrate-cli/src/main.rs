//! CLI for executing content migrations.
//!
//! Reads a JSON manifest of migration templates, orders them by
//! dependency, and runs them against a relational source (or a JSON
//! fixture file), writing JSON-lines output and recording progress in
//! the ID map. Emits JSON lines on stdout for machine consumption.
//!
//! Exit codes: 0 = run completed with zero failed migrations (or
//! yielded on its time budget with resumable state saved); 1 = run
//! completed with at least one failed migration; 2 = hard abort before
//! any migration ran (configuration or topology error).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration_engine::{
    BatchRunCoordinator, IdMap, InMemoryIdMap, InMemorySourceProvider, MigrationId,
    MigrationRegistry, MigrationTemplate, PgIdMap, RunOptions, RunReport, RunState, RunTick,
    SourceRowProvider, SqlSourceProvider,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

mod config;
mod destination;

use config::Config;
use destination::JsonLinesDestination;

#[derive(Parser)]
#[command(name = "migrate")]
#[command(about = "Batched, resumable content migrations")]
struct Cli {
    /// Path to the migration manifest (JSON array of templates).
    #[arg(long, global = true, default_value = "migrations.json")]
    manifest: PathBuf,

    /// JSON fixture file to use as the source instead of
    /// SOURCE_DATABASE_URL.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered migrations with tags and dependencies
    List {
        /// Only list migrations carrying this source tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Run migrations (dependency order, plus transitive dependencies)
    Run {
        /// Migration ids to run; empty means all applicable
        names: Vec<String>,
        /// Only run migrations carrying this source tag
        #[arg(long, conflicts_with = "names")]
        tag: Option<String>,
        /// Wall-clock budget in seconds for this invocation
        #[arg(long)]
        budget_secs: Option<u64>,
        #[arg(long)]
        dry_run: bool,
        /// Where to persist resumable state when the budget expires
        #[arg(long, default_value = "migrate-state.json")]
        state_file: PathBuf,
        /// Directory for JSON-lines output files
        #[arg(long, default_value = "migrated")]
        output_dir: PathBuf,
    },

    /// Resume a run from a saved state file
    Resume {
        #[arg(long, default_value = "migrate-state.json")]
        state_file: PathBuf,
        #[arg(long)]
        budget_secs: Option<u64>,
        #[arg(long, default_value = "migrated")]
        output_dir: PathBuf,
    },

    /// Show per-migration ID map counts against source estimates
    Status { names: Vec<String> },

    /// Roll back migrations (reverse dependency order)
    Rollback {
        names: Vec<String>,
        #[arg(long, default_value = "migrated")]
        output_dir: PathBuf,
    },
}

// ============================================================================
// JSON output types
// ============================================================================

#[derive(Serialize)]
struct Event<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_file: Option<String>,
}

#[derive(Serialize)]
struct MigrationInfo {
    id: String,
    source_tags: Vec<String>,
    dependencies: Vec<String>,
    enabled: bool,
}

#[derive(Serialize)]
struct StatusLine {
    id: String,
    processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    estimated: Option<u64>,
}

#[derive(Serialize)]
struct MigrationProgress<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    migration: String,
    status: &'a str,
    imported: u64,
    updated: u64,
    unchanged: u64,
    skipped_rows: u64,
    failed_rows: u64,
}

fn emit(value: &impl Serialize) {
    // stdout is the machine protocol; logs go to stderr via tracing.
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("failed to encode output: {err}"),
    }
}

fn emit_event(event_type: &str, message: Option<String>) {
    emit(&Event {
        event_type,
        message,
        report: None,
        state_file: None,
    });
}

// ============================================================================
// Wiring
// ============================================================================

/// Load the manifest and resolve its templates against the source;
/// fan-out templates register one migration per variant discovered in
/// the source at this point.
async fn load_registry(
    manifest: &Path,
    source: &dyn SourceRowProvider,
) -> Result<MigrationRegistry> {
    let contents = fs::read_to_string(manifest)
        .with_context(|| format!("failed to read manifest {}", manifest.display()))?;
    let templates: Vec<MigrationTemplate> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse manifest {}", manifest.display()))?;

    let mut registry = MigrationRegistry::new();
    for template in &templates {
        for def in template.resolve(source).await? {
            registry.register(def)?;
        }
    }
    registry.validate()?;
    Ok(registry)
}

/// Fixture format: `{ "table_name": [ { "field": value, ... }, ... ] }`.
fn load_fixture(path: &Path) -> Result<InMemorySourceProvider> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let tables: HashMap<String, Vec<serde_json::Map<String, Value>>> =
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse fixture {}", path.display()))?;

    let mut provider = InMemorySourceProvider::new();
    for (name, rows) in tables {
        let rows = rows
            .into_iter()
            .map(|object| object.into_iter().collect())
            .collect();
        provider.insert_table(name, rows);
    }
    Ok(provider)
}

fn build_source(
    config: &Config,
    fixture: Option<&PathBuf>,
) -> Result<Arc<dyn SourceRowProvider>> {
    if let Some(path) = fixture {
        return Ok(Arc::new(load_fixture(path)?));
    }
    let url = config
        .source_database_url
        .as_deref()
        .context("SOURCE_DATABASE_URL must be set (or pass --fixture)")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_lazy(url)
        .context("invalid SOURCE_DATABASE_URL")?;
    let mut provider = SqlSourceProvider::new(pool);
    if let Some(prefix) = &config.source_table_prefix {
        provider = provider.with_table_prefix(prefix.clone());
    }
    Ok(Arc::new(provider))
}

fn build_id_map(config: &Config) -> Result<Arc<dyn IdMap>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect_lazy(url)
                .context("invalid DATABASE_URL")?;
            Ok(Arc::new(PgIdMap::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using an in-memory ID map");
            Ok(Arc::new(InMemoryIdMap::new()))
        }
    }
}

fn selected_ids(
    registry: &MigrationRegistry,
    names: &[String],
    tag: Option<&str>,
) -> Vec<MigrationId> {
    if !names.is_empty() {
        return names.iter().map(|n| MigrationId::new(n.clone())).collect();
    }
    match tag {
        Some(tag) => registry
            .find_by_tag(tag)
            .into_iter()
            .map(|d| d.id.clone())
            .collect(),
        None => registry.all_ids(),
    }
}

fn coordinator(
    config: &Config,
    source: Arc<dyn SourceRowProvider>,
    output_dir: &Path,
    budget_secs: Option<u64>,
    dry_run: bool,
) -> Result<BatchRunCoordinator> {
    Ok(BatchRunCoordinator::new(
        source,
        Arc::new(JsonLinesDestination::new(output_dir)),
        build_id_map(config)?,
        RunOptions {
            time_budget: budget_secs.map(Duration::from_secs),
            dry_run,
            ..RunOptions::default()
        },
    ))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            // Hard abort: nothing was executed.
            emit_event("error", Some(format!("{err:#}")));
            ExitCode::from(2)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = Config::from_env()?;
    let source = build_source(&config, cli.fixture.as_ref())?;
    let registry = load_registry(&cli.manifest, source.as_ref()).await?;

    match cli.command {
        Commands::List { tag } => {
            let infos: Vec<MigrationInfo> = registry
                .all_ids()
                .iter()
                .filter_map(|id| registry.get(id))
                .filter(|d| match &tag {
                    Some(tag) => d.source_tags.iter().any(|t| t == tag),
                    None => true,
                })
                .map(|d| MigrationInfo {
                    id: d.id.to_string(),
                    source_tags: d.source_tags.clone(),
                    dependencies: d.dependencies.iter().map(|m| m.to_string()).collect(),
                    enabled: d.enabled,
                })
                .collect();
            emit(&infos);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            names,
            tag,
            budget_secs,
            dry_run,
            state_file,
            output_dir,
        } => {
            let coordinator =
                coordinator(&config, source, &output_dir, budget_secs, dry_run)?;
            let requested = selected_ids(&registry, &names, tag.as_deref());
            let mut state = coordinator.start(&registry, &requested)?;
            emit_event("init", Some(format!("{} migrations ordered", requested.len())));
            finish_tick(&coordinator, &registry, &mut state, &state_file).await
        }

        Commands::Resume {
            state_file,
            budget_secs,
            output_dir,
        } => {
            let json = fs::read_to_string(&state_file)
                .with_context(|| format!("failed to read state file {}", state_file.display()))?;
            let mut state = RunState::from_json(&json)?;
            let coordinator = coordinator(&config, source, &output_dir, budget_secs, false)?;
            emit_event(
                "resume",
                state.current().map(|id| format!("resuming at {id}")),
            );
            finish_tick(&coordinator, &registry, &mut state, &state_file).await
        }

        Commands::Status { names } => {
            let id_map = build_id_map(&config)?;
            let ids = selected_ids(&registry, &names, None);
            for id in &ids {
                let Some(def) = registry.get(id) else {
                    emit_event("error", Some(format!("unknown migration {id}")));
                    continue;
                };
                let processed = id_map.processed_count(id).await.unwrap_or(0);
                let estimated = source.estimate(def).await.ok().flatten();
                emit(&StatusLine {
                    id: id.to_string(),
                    processed,
                    estimated,
                });
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Rollback { names, output_dir } => {
            let coordinator = coordinator(&config, source, &output_dir, None, false)?;
            let requested = selected_ids(&registry, &names, None);
            let removed = coordinator.rollback(&registry, &requested).await?;
            emit_event("complete", Some(format!("rolled back {removed} rows")));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run one bounded tick, persisting state on yield and reporting on
/// completion.
async fn finish_tick(
    coordinator: &BatchRunCoordinator,
    registry: &MigrationRegistry,
    state: &mut RunState,
    state_file: &Path,
) -> Result<ExitCode> {
    match coordinator.tick(registry, state).await? {
        RunTick::Finished(report) => {
            // A finished run leaves no state to resume.
            if state_file.exists() {
                fs::remove_file(state_file).ok();
            }
            for outcome in &report.migrations {
                emit(&MigrationProgress {
                    event_type: "progress",
                    migration: outcome.id.to_string(),
                    status: outcome.status.as_str(),
                    imported: outcome.imported,
                    updated: outcome.updated,
                    unchanged: outcome.unchanged,
                    skipped_rows: outcome.skipped_rows,
                    failed_rows: outcome.failed_rows,
                });
            }
            emit(&Event {
                event_type: "complete",
                message: Some(format!(
                    "{} succeeded, {} failed, {} rows processed",
                    report.successes, report.failures, report.processed_rows
                )),
                report: Some(&report),
                state_file: None,
            });
            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
        RunTick::Yielded => {
            let json = state.to_json().context("failed to serialize run state")?;
            fs::write(state_file, json)
                .with_context(|| format!("failed to write state file {}", state_file.display()))?;
            emit(&Event {
                event_type: "yielded",
                message: state.current().map(|id| format!("paused in {id}")),
                report: None,
                state_file: Some(state_file.display().to_string()),
            });
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_rejects_names_combined_with_tag() {
        assert!(Cli::try_parse_from(["migrate", "run", "users", "--tag", "d6"]).is_err());
        assert!(Cli::try_parse_from(["migrate", "run", "--tag", "d6"]).is_ok());
        assert!(Cli::try_parse_from(["migrate", "run", "users"]).is_ok());
    }
}
