//! End-to-end pipeline properties, exercised with the in-memory
//! source, destination, and ID map.

use std::sync::Arc;
use std::time::Duration;

use migration_engine::{
    BatchRunCoordinator, DestinationSpec, FieldMapping, IdField, IdMap, InMemoryDestination,
    InMemoryIdMap, InMemorySourceProvider, MigrationDefinition, MigrationId, MigrationRegistry,
    MigrationStatus, RunOptions, RunState, RunTick, SourceSpec, TransformStep,
};
use serde_json::json;

fn users_definition() -> MigrationDefinition {
    MigrationDefinition {
        id: MigrationId::from("users"),
        source_tags: vec!["d6".into()],
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

fn nodes_definition() -> MigrationDefinition {
    MigrationDefinition {
        id: MigrationId::from("nodes"),
        source_tags: vec!["d6".into()],
        source: SourceSpec::new("nodes", vec!["nid".into(), "uid".into(), "title".into()]),
        ids: vec![IdField::int("nid")],
        destination: DestinationSpec {
            target: "nodes".into(),
            mappings: vec![
                FieldMapping::copy("title", "title"),
                FieldMapping::copy("uid", "author").with_step(TransformStep::Lookup {
                    migration: MigrationId::from("users"),
                    required: true,
                }),
            ],
        },
        dependencies: vec![MigrationId::from("users")],
        enabled: true,
    }
}

fn users_table(names: &[(i64, &str)]) -> Vec<Vec<(String, serde_json::Value)>> {
    names
        .iter()
        .map(|(uid, name)| vec![("uid".to_string(), json!(uid)), ("name".to_string(), json!(name))])
        .collect()
}

struct Fixture {
    source: InMemorySourceProvider,
    destination: Arc<InMemoryDestination>,
    id_map: Arc<InMemoryIdMap>,
    registry: MigrationRegistry,
}

impl Fixture {
    fn users_only(names: &[(i64, &str)]) -> Self {
        let source = InMemorySourceProvider::new().with_table("users", users_table(names));
        let mut registry = MigrationRegistry::new();
        registry.register(users_definition()).unwrap();
        Self {
            source,
            destination: Arc::new(InMemoryDestination::new()),
            id_map: Arc::new(InMemoryIdMap::new()),
            registry,
        }
    }

    fn coordinator(&self, options: RunOptions) -> BatchRunCoordinator {
        BatchRunCoordinator::new(
            Arc::new(self.source.clone()),
            self.destination.clone(),
            self.id_map.clone(),
            options,
        )
    }
}

#[tokio::test]
async fn users_end_to_end() {
    let fixture = Fixture::users_only(&[(1, "alice"), (2, "bob")]);
    let coordinator = fixture.coordinator(RunOptions::default());

    let report = coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();

    assert!(report.is_success());
    let records = fixture.destination.records("users");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].fields, vec![("username".to_string(), json!("alice"))]);
    assert_eq!(records[1].fields, vec![("username".to_string(), json!("bob"))]);

    // The ID map pairs each source id with the destination identity
    // that was actually assigned.
    let users = MigrationId::from("users");
    let alice = fixture.id_map.lookup(&users, "1").await.unwrap().unwrap();
    let bob = fixture.id_map.lookup(&users, "2").await.unwrap().unwrap();
    assert_eq!(alice.destination.unwrap(), records[0].id);
    assert_eq!(bob.destination.unwrap(), records[1].id);
}

#[tokio::test]
async fn rerun_with_added_row_writes_exactly_one_record() {
    let mut fixture = Fixture::users_only(&[(1, "alice"), (2, "bob")]);
    let coordinator = fixture.coordinator(RunOptions::default());
    coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();
    let first_ids: Vec<_> = fixture
        .destination
        .records("users")
        .iter()
        .map(|r| r.id.clone())
        .collect();

    fixture.source.insert_table(
        "users",
        users_table(&[(1, "alice"), (2, "bob"), (3, "carol")]),
    );
    let coordinator = fixture.coordinator(RunOptions::default());
    let report = coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.migrations[0].imported, 1);
    assert_eq!(report.migrations[0].unchanged, 2);

    let records = fixture.destination.records("users");
    assert_eq!(records.len(), 3);
    // The first two records are untouched.
    assert_eq!(records[0].id, first_ids[0]);
    assert_eq!(records[1].id, first_ids[1]);
    assert_eq!(records[2].fields, vec![("username".to_string(), json!("carol"))]);
}

#[tokio::test]
async fn second_run_against_unchanged_source_writes_nothing() {
    let fixture = Fixture::users_only(&[(1, "alice"), (2, "bob")]);
    let coordinator = fixture.coordinator(RunOptions::default());
    coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();
    let writes = fixture.destination.write_count();

    let report = coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(fixture.destination.write_count(), writes);
    assert_eq!(report.migrations[0].unchanged, 2);
}

#[tokio::test]
async fn interrupted_run_resumes_to_the_same_final_state() {
    let names: Vec<(i64, String)> = (1..=10).map(|i| (i, format!("user-{i}"))).collect();
    let name_refs: Vec<(i64, &str)> = names.iter().map(|(i, n)| (*i, n.as_str())).collect();
    let fixture = Fixture::users_only(&name_refs);

    // Tiny budget so the run yields at least once mid-stream.
    let bounded = fixture.coordinator(RunOptions {
        time_budget: Some(Duration::from_micros(1)),
        ..RunOptions::default()
    });
    let unbounded = fixture.coordinator(RunOptions::default());

    let mut state = bounded
        .start(&fixture.registry, &[MigrationId::from("users")])
        .unwrap();

    let mut guard = 0;
    let report = loop {
        // Round-trip the state through JSON between every window, as
        // a host batch system would.
        let tick = bounded.tick(&fixture.registry, &mut state).await.unwrap();
        match tick {
            RunTick::Finished(report) => break report,
            RunTick::Yielded => {
                let json = state.to_json().unwrap();
                state = RunState::from_json(&json).unwrap();
            }
        }
        guard += 1;
        if guard > 3 {
            // Let the unbounded coordinator finish from wherever the
            // bounded one stopped.
            let tick = unbounded.tick(&fixture.registry, &mut state).await.unwrap();
            let RunTick::Finished(report) = tick else {
                panic!("unbounded tick must finish the run");
            };
            break report;
        }
    };

    assert!(report.is_success());
    let records = fixture.destination.records("users");
    assert_eq!(records.len(), 10, "no missed rows");
    let mut usernames: Vec<String> = records
        .iter()
        .map(|r| r.fields[0].1.as_str().unwrap().to_string())
        .collect();
    usernames.sort();
    let mut expected: Vec<String> = names.iter().map(|(_, n)| n.clone()).collect();
    expected.sort();
    assert_eq!(usernames, expected, "no duplicate writes");
}

#[tokio::test]
async fn dependency_ordering_and_lookup_resolution() {
    let source = InMemorySourceProvider::new()
        .with_table("users", users_table(&[(1, "alice")]))
        .with_table(
            "nodes",
            vec![vec![
                ("nid".to_string(), json!(10)),
                ("uid".to_string(), json!(1)),
                ("title".to_string(), json!("hello")),
            ]],
        );
    let destination = Arc::new(InMemoryDestination::new());
    let id_map = Arc::new(InMemoryIdMap::new());
    let mut registry = MigrationRegistry::new();
    // Registered dependent-first; ordering must still run users first.
    registry.register(nodes_definition()).unwrap();
    registry.register(users_definition()).unwrap();

    let coordinator = BatchRunCoordinator::new(
        Arc::new(source),
        destination.clone(),
        id_map.clone(),
        RunOptions::default(),
    );
    let report = coordinator
        .run_to_completion(&registry, &[MigrationId::from("nodes")])
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.migrations[0].id.as_str(), "users");
    assert_eq!(report.migrations[1].id.as_str(), "nodes");

    let user_id = destination.records("users")[0].id.clone();
    let node = &destination.records("nodes")[0];
    assert_eq!(
        node.fields,
        vec![
            ("title".to_string(), json!("hello")),
            ("author".to_string(), json!(user_id.as_str())),
        ]
    );
}

#[tokio::test]
async fn per_row_isolation_with_one_malformed_row() {
    let fixture = Fixture::users_only(&[(1, "alice"), (2, "bad"), (3, "carol")]);
    fixture.destination.fail_validation_for("2");
    let coordinator = fixture.coordinator(RunOptions::default());

    let report = coordinator
        .run_to_completion(&fixture.registry, &[MigrationId::from("users")])
        .await
        .unwrap();

    // A validation error is per-row, not systemic: the migration
    // completes with exactly one counted failure.
    assert_eq!(report.migrations[0].status, MigrationStatus::Completed);
    assert_eq!(report.migrations[0].failed_rows, 1);
    assert_eq!(fixture.destination.records("users").len(), 2);
    assert!(report.messages.iter().any(|m| m.contains("row 2")));
}

#[tokio::test]
async fn cycle_aborts_before_reading_any_source_row() {
    let mut a = users_definition();
    a.id = MigrationId::from("a");
    a.dependencies = vec![MigrationId::from("b")];
    let mut b = users_definition();
    b.id = MigrationId::from("b");
    b.dependencies = vec![MigrationId::from("a")];

    let mut registry = MigrationRegistry::new();
    registry.register(a).unwrap();
    registry.register(b).unwrap();

    let destination = Arc::new(InMemoryDestination::new());
    let coordinator = BatchRunCoordinator::new(
        Arc::new(InMemorySourceProvider::new().with_table("users", users_table(&[(1, "x")]))),
        destination.clone(),
        Arc::new(InMemoryIdMap::new()),
        RunOptions::default(),
    );

    let err = coordinator
        .run_to_completion(&registry, &[MigrationId::from("a")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cycle"));
    assert_eq!(destination.write_count(), 0);
}

#[tokio::test]
async fn failed_prerequisite_marks_dependent_skipped() {
    let source = InMemorySourceProvider::new()
        .with_table("users", users_table(&[(1, "alice")]))
        .with_table(
            "nodes",
            vec![vec![
                ("nid".to_string(), json!(10)),
                ("uid".to_string(), json!(1)),
                ("title".to_string(), json!("hello")),
            ]],
        );
    let destination = Arc::new(InMemoryDestination::new());
    destination.fail_fatally_after(0);

    let mut registry = MigrationRegistry::new();
    registry.register(users_definition()).unwrap();
    registry.register(nodes_definition()).unwrap();

    let coordinator = BatchRunCoordinator::new(
        Arc::new(source),
        destination.clone(),
        Arc::new(InMemoryIdMap::new()),
        RunOptions::default(),
    );
    let report = coordinator
        .run_to_completion(&registry, &[MigrationId::from("nodes")])
        .await
        .unwrap();

    assert_eq!(report.migrations[0].status, MigrationStatus::Failed);
    assert_eq!(report.migrations[1].status, MigrationStatus::Skipped);
    assert_eq!(report.failures, 1);
}
