mod common;

use common::{dispatcher, orders, ScriptedEngine};
use modelyard_core::actions::{
    Action, AddModelArgs, Dispatcher, IdArgs, UpdateModelNameArgs, UpdateModelQueryArgs,
};
use modelyard_core::config::SyncConfig;
use modelyard_core::state::{
    DerivedModel, EntityKind, EntityStatus, PersistentModel, StateFiles, StateKind, StreamKey,
};
use modelyard_core::sync::{ConflictWinner, ProjectLayout, SyncService};
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn engine() -> Arc<ScriptedEngine> {
    let engine = ScriptedEngine::new();
    engine.relation("from orders", orders());
    engine
}

fn service(d: &Dispatcher, dir: &TempDir) -> SyncService {
    let layout = ProjectLayout::new(dir.path());
    layout.ensure().unwrap();
    SyncService::new(d.clone(), layout, SyncConfig::default())
}

fn model_by_name(d: &Dispatcher, name: &str) -> Option<PersistentModel> {
    d.store()
        .get_current_state::<PersistentModel>()
        .unwrap()
        .into_iter()
        .find(|m| m.name == name)
}

async fn add_model(d: &Dispatcher, name: &str, query: &str) -> String {
    d.dispatch(Action::AddModel(AddModelArgs {
        name: name.into(),
        query: query.into(),
    }))
    .await
    .unwrap()
    .id()
    .unwrap()
    .to_string()
}

#[tokio::test]
async fn test_new_sql_file_becomes_a_model() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    fs::write(dir.path().join("models/recent.sql"), "select * from orders").unwrap();

    let report = sync.tick().await.unwrap();
    assert_eq!(report.models_added, 1);
    sync.settle().await;

    let model = model_by_name(&d, "recent").unwrap();
    assert_eq!(model.query, "select * from orders");
    assert_eq!(model.file_name, "recent.sql");
    let derived = d
        .store()
        .get_entity_by_id::<DerivedModel>(&model.id)
        .unwrap()
        .unwrap();
    assert_eq!(derived.status, EntityStatus::Idle);
    assert_eq!(derived.cardinality, Some(3));

    // The file is adopted, nothing is rewritten or added twice.
    let report = sync.tick().await.unwrap();
    assert_eq!(report.models_added, 0);
    assert_eq!(report.files_written, 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("models/recent.sql")).unwrap(),
        "select * from orders"
    );
}

#[tokio::test]
async fn test_sql_file_name_is_normalized() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    fs::write(dir.path().join("models/Big Orders.sql"), "select * from orders").unwrap();

    sync.tick().await.unwrap();
    sync.settle().await;

    assert!(model_by_name(&d, "big_orders").is_some());
    assert!(dir.path().join("models/big_orders.sql").is_file());
    assert!(!dir.path().join("models/Big Orders.sql").exists());
}

#[tokio::test]
async fn test_model_query_round_trips_through_file() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    let id = add_model(&d, "recent", "select * from orders").await;

    let report = sync.tick().await.unwrap();
    assert_eq!(report.files_written, 1);
    let path = dir.path().join("models/recent.sql");
    assert_eq!(fs::read_to_string(&path).unwrap(), "select * from orders");

    // External edit flows into the model.
    fs::write(&path, "select * from orders where amount > 2\n").unwrap();
    let report = sync.tick().await.unwrap();
    assert_eq!(report.models_updated, 1);
    sync.settle().await;
    let model = d
        .store()
        .get_entity_by_id::<PersistentModel>(&id)
        .unwrap()
        .unwrap();
    assert_eq!(model.query, "select * from orders where amount > 2\n");

    // Derived state matches the same edit made through the dispatcher.
    let direct = dispatcher(engine(), 2);
    let direct_id = add_model(&direct, "recent", "select 1").await;
    direct
        .dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
            id: direct_id.clone(),
            query: "select * from orders where amount > 2\n".into(),
        }))
        .await
        .unwrap();
    let via_file = d
        .store()
        .get_entity_by_id::<DerivedModel>(&id)
        .unwrap()
        .unwrap();
    let via_dispatch = direct
        .store()
        .get_entity_by_id::<DerivedModel>(&direct_id)
        .unwrap()
        .unwrap();
    assert_eq!(via_file.status, EntityStatus::Idle);
    assert_eq!(via_file.sanitized_query, via_dispatch.sanitized_query);
    assert_eq!(via_file.cardinality, via_dispatch.cardinality);
    assert_eq!(via_file.profile, via_dispatch.profile);
    assert!(!via_file.profile.is_empty());

    // Edits in memory flow back to the file.
    d.dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
        id: id.clone(),
        query: "select id from orders".into(),
    }))
    .await
    .unwrap();
    let report = sync.tick().await.unwrap();
    assert_eq!(report.files_written, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(fs::read_to_string(&path).unwrap(), "select id from orders");

    let report = sync.tick().await.unwrap();
    assert_eq!(report.files_written, 0);
    assert_eq!(report.models_updated, 0);
}

#[tokio::test]
async fn test_deleted_file_is_restored_from_memory() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    add_model(&d, "recent", "select * from orders").await;
    sync.tick().await.unwrap();

    let path = dir.path().join("models/recent.sql");
    fs::remove_file(&path).unwrap();
    sync.tick().await.unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "select * from orders");
    assert!(model_by_name(&d, "recent").is_some());
}

#[tokio::test]
async fn test_deleted_model_removes_file() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    let id = add_model(&d, "recent", "select * from orders").await;
    sync.tick().await.unwrap();

    d.dispatch(Action::DeleteModel(IdArgs::new(id))).await.unwrap();
    let report = sync.tick().await.unwrap();
    assert_eq!(report.files_removed, 1);
    assert!(!dir.path().join("models/recent.sql").exists());
}

#[tokio::test]
async fn test_renamed_model_moves_file() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    let id = add_model(&d, "recent", "select * from orders").await;
    sync.tick().await.unwrap();

    d.dispatch(Action::UpdateModelName(UpdateModelNameArgs {
        id,
        name: "latest".into(),
    }))
    .await
    .unwrap();
    sync.tick().await.unwrap();

    assert!(!dir.path().join("models/recent.sql").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("models/latest.sql")).unwrap(),
        "select * from orders"
    );
    // The moved file is not mistaken for a new model.
    let report = sync.tick().await.unwrap();
    assert_eq!(report.models_added, 0);
}

#[tokio::test]
async fn test_conflicting_edits_keep_newer_side() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    let id = add_model(&d, "recent", "select * from orders").await;
    sync.tick().await.unwrap();

    // File edited first, then the model: the model is newer.
    let path = dir.path().join("models/recent.sql");
    fs::write(&path, "select region from orders").unwrap();
    d.dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
        id: id.clone(),
        query: "select amount from orders".into(),
    }))
    .await
    .unwrap();

    let report = sync.tick().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].winner, ConflictWinner::Memory);
    assert_eq!(report.conflicts[0].model_id, id);
    assert_eq!(fs::read_to_string(&path).unwrap(), "select amount from orders");
    assert_eq!(sync.status().conflicts, 1);
}

#[tokio::test]
async fn test_state_streams_are_written_and_hydrated() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    let id = add_model(&d, "recent", "select * from orders").await;
    let report = sync.tick().await.unwrap();
    assert!(report.streams_written > 0);

    let files = StateFiles::new(dir.path().join("state"));
    let stream = StreamKey::new(EntityKind::Model, StateKind::Persistent);
    let saved = files.load(stream).unwrap();
    assert_eq!(saved, d.store().snapshot(stream));

    // Nothing changed, nothing written.
    let report = sync.tick().await.unwrap();
    assert_eq!(report.streams_written, 0);

    let fresh = dispatcher(engine(), 2);
    let mut restored = service(&fresh, &dir);
    let loaded = restored.hydrate().await.unwrap();
    assert!(loaded >= 2);
    for stream in StreamKey::all() {
        assert_eq!(fresh.store().snapshot(stream), d.store().snapshot(stream));
    }
    let model = fresh
        .store()
        .get_entity_by_id::<DerivedModel>(&id)
        .unwrap()
        .unwrap();
    assert_eq!(model.status, EntityStatus::Idle);

    // Hydrated state counts as written; the existing file is adopted.
    let report = restored.tick().await.unwrap();
    assert_eq!(report.streams_written, 0);
    assert_eq!(report.files_written, 0);
    assert_eq!(report.models_added, 0);
}

#[tokio::test]
async fn test_busy_records_settle_on_hydrate() {
    let dir = TempDir::new().unwrap();
    let files = StateFiles::new(dir.path().join("state"));
    let derived = StreamKey::new(EntityKind::Model, StateKind::Derived);
    let persistent = StreamKey::new(EntityKind::Model, StateKind::Persistent);

    let source = dispatcher(engine(), 2);
    let id = add_model(&source, "recent", "select * from orders").await;
    let mut records = source.store().snapshot(derived);
    records[0]["status"] = serde_json::json!("profiling");
    files.save(derived, &records).unwrap();
    files.save(persistent, &source.store().snapshot(persistent)).unwrap();

    let fresh = dispatcher(engine(), 2);
    let mut restored = service(&fresh, &dir);
    assert_eq!(restored.hydrate().await.unwrap(), 2);
    let model = fresh
        .store()
        .get_entity_by_id::<DerivedModel>(&id)
        .unwrap()
        .unwrap();
    assert_eq!(model.status, EntityStatus::Idle);
    let saved_profile = records[0]["profile"].as_array().map_or(0, Vec::len);
    assert_eq!(model.profile.len(), saved_profile);
}

#[tokio::test]
async fn test_io_errors_surface_after_threshold() {
    let dir = TempDir::new().unwrap();
    // A plain file where the models directory should be.
    fs::write(dir.path().join("models"), "not a directory").unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = SyncService::new(
        d.clone(),
        ProjectLayout::new(dir.path()),
        SyncConfig {
            io_error_threshold: 3,
            ..SyncConfig::default()
        },
    );

    for _ in 0..2 {
        assert!(sync.tick().await.is_err());
    }
    assert_eq!(sync.status().consecutive_io_failures, 2);
    assert!(sync.status().last_io_error.is_none());

    assert!(sync.tick().await.is_err());
    let status = sync.status();
    assert_eq!(status.consecutive_io_failures, 3);
    assert!(status.last_io_error.is_some());

    fs::remove_file(dir.path().join("models")).unwrap();
    sync.tick().await.unwrap();
    let status = sync.status();
    assert_eq!(status.consecutive_io_failures, 0);
    assert!(status.last_io_error.is_none());
    assert_eq!(status.ticks, 4);
}

#[tokio::test]
async fn test_run_stops_on_shutdown_and_flushes() {
    let dir = TempDir::new().unwrap();
    let d = dispatcher(engine(), 2);
    let mut sync = service(&d, &dir);
    add_model(&d, "recent", "select * from orders").await;

    let status = sync
        .run(tokio::time::sleep(std::time::Duration::from_millis(1_200)))
        .await;
    assert!(status.ticks >= 2);
    assert!(dir.path().join("models/recent.sql").is_file());
    assert!(dir
        .path()
        .join("state/persistent_model_state.json")
        .is_file());
}
