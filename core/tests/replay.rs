mod common;

use common::{orders, ScriptedEngine};
use modelyard_core::actions::{
    Action, AddDimensionArgs, AddMeasureArgs, AddModelArgs, CreateMetricsDefinitionArgs,
    DropTableArgs, IdArgs, ImportTableArgs, InitProjectArgs, SetActiveEntityArgs,
    UpdateModelQueryArgs,
};
use modelyard_core::config::{AppConfig, JournalConfig};
use modelyard_core::context::AppContext;
use modelyard_core::journal::replay_journal;
use modelyard_core::state::{EntityKind, StateSnapshot, StreamKey};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[tokio::test]
async fn test_journal_replay_matches_live_state() {
    let dir = TempDir::new().unwrap();
    let engine = ScriptedEngine::new();
    engine.source("orders.csv", orders());
    engine.source("returns.csv", orders());
    engine.relation("from orders", orders());

    let cfg = AppConfig {
        journal: JournalConfig {
            enabled: true,
            drop_when_full: false,
            ..JournalConfig::default()
        },
        ..AppConfig::default()
    };
    let ctx = AppContext::new(cfg, dir.path(), engine.clone()).await.unwrap();

    let run = |action: Action| ctx.dispatch(action);
    run(Action::InitProject(InitProjectArgs {
        project_path: dir.path().display().to_string(),
        database_path: None,
    }))
    .await
    .unwrap();
    let table = run(Action::ImportTable(ImportTableArgs {
        path: "/data/orders.csv".into(),
        name: None,
    }))
    .await
    .unwrap();
    run(Action::ImportTable(ImportTableArgs {
        path: "/data/returns.csv".into(),
        name: None,
    }))
    .await
    .unwrap();
    run(Action::DropTable(DropTableArgs {
        name: "returns".into(),
    }))
    .await
    .unwrap();

    let model_id = run(Action::AddModel(AddModelArgs {
        name: "recent".into(),
        query: "select * from orders".into(),
    }))
    .await
    .unwrap()
    .id()
    .unwrap()
    .to_string();
    run(Action::UpdateModelQuery(UpdateModelQueryArgs {
        id: model_id.clone(),
        query: "select * from orders where amount > 2".into(),
    }))
    .await
    .unwrap();
    run(Action::SetActiveEntity(SetActiveEntityArgs {
        kind: EntityKind::Table,
        id: table.id().unwrap().to_string(),
    }))
    .await
    .unwrap();

    let def_id = run(Action::CreateMetricsDefinition(CreateMetricsDefinitionArgs {
        name: "revenue".into(),
        model_id: model_id.clone(),
        time_dimension: Some("created_at".into()),
    }))
    .await
    .unwrap()
    .id()
    .unwrap()
    .to_string();
    run(Action::AddMeasure(AddMeasureArgs {
        metrics_definition_id: def_id.clone(),
        expression: "sum(amount)".into(),
        label: Some("Revenue".into()),
        sql_name: None,
    }))
    .await
    .unwrap();
    run(Action::AddDimension(AddDimensionArgs {
        metrics_definition_id: def_id.clone(),
        column: "region".into(),
        label: None,
    }))
    .await
    .unwrap();
    run(Action::ValidateMetricsDefinition(IdArgs::new(def_id)))
        .await
        .unwrap();

    let live = StateSnapshot::capture(ctx.store());
    let journal_path = dir.path().join(JournalConfig::default().path);
    ctx.shutdown().await;

    let (replayed, report) = replay_journal(&journal_path).unwrap();
    assert_eq!(report.skipped_lines, 0);
    assert!(report.entries > 10);
    for stream in StreamKey::all() {
        assert_eq!(replayed.snapshot(stream), *live.stream(stream), "stream {stream}");
    }
}
