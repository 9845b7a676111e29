mod common;

use common::{dispatcher, orders, single_column, wait_started, ScriptedEngine};
use modelyard_core::actions::{
    Action, ActionOutcome, AddModelArgs, ImportTableArgs, SetActiveEntityArgs,
    UpdateModelQueryArgs,
};
use modelyard_core::state::{DerivedModel, EntityKind, EntityStatus, PersistentModel};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn add_model(name: &str, query: &str) -> Action {
    Action::AddModel(AddModelArgs {
        name: name.to_string(),
        query: query.to_string(),
    })
}

fn model_id(d: &modelyard_core::actions::Dispatcher, name: &str) -> String {
    d.store()
        .get_current_state::<PersistentModel>()
        .unwrap()
        .into_iter()
        .find(|m| m.name == name)
        .map(|m| m.id)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_query_edit_supersedes_running_pipeline() {
    let engine = ScriptedEngine::new();
    engine.relation("AS first", single_column("first", &[1, 2]));
    engine.relation("AS second", single_column("second", &[1, 2, 3]));
    engine.delay("AS first", Duration::from_millis(100));
    let d = dispatcher(engine.clone(), 4);

    d.dispatch(add_model("m", "")).await.unwrap();
    let id = model_id(&d, "m");

    let order = Arc::new(Mutex::new(Vec::new()));
    let run = |label: &'static str, query: &'static str| {
        let d = d.clone();
        let id = id.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let outcome = d
                .dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
                    id,
                    query: query.to_string(),
                }))
                .await
                .unwrap();
            order.lock().unwrap().push(label);
            outcome
        })
    };

    let a = run("a", "select 1 AS first");
    wait_started(&engine, "AS first").await;
    let b = run("b", "select 1 AS second");

    let a = a.await.unwrap();
    let b = b.await.unwrap();
    assert_eq!(a, ActionOutcome::Superseded { id: id.clone() });
    assert_eq!(b, ActionOutcome::completed(id.clone()));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

    let model = d.store().get_entity_by_id::<DerivedModel>(&id).unwrap().unwrap();
    assert_eq!(model.status, EntityStatus::Idle);
    assert_eq!(model.sanitized_query, "select 1 AS second");
    assert_eq!(model.cardinality, Some(3));
    let names: Vec<&str> = model.profile.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["second"]);
}

#[tokio::test(start_paused = true)]
async fn test_whitespace_edit_still_reexecutes() {
    let engine = ScriptedEngine::new();
    engine.relation("AS x", single_column("x", &[1]));
    let d = dispatcher(engine.clone(), 2);
    d.dispatch(add_model("m", "select 1 AS x")).await.unwrap();
    let id = model_id(&d, "m");
    let before = engine.finished().len();

    let outcome = d
        .dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
            id: id.clone(),
            query: "select 1 AS x ".into(),
        }))
        .await
        .unwrap();
    assert_eq!(outcome, ActionOutcome::completed(id));
    assert!(engine.finished().len() > before);
}

#[tokio::test(start_paused = true)]
async fn test_model_query_overtakes_dependent_table_profiling() {
    let engine = ScriptedEngine::new();
    engine.source("orders.csv", orders());
    engine.relation("from orders", orders());
    engine.delay("\"orders\"", Duration::from_millis(10));
    let d = dispatcher(engine.clone(), 1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let table = {
        let (d, order) = (d.clone(), order.clone());
        tokio::spawn(async move {
            let outcome = d
                .dispatch(Action::ImportTable(ImportTableArgs {
                    path: "/data/orders.csv".into(),
                    name: None,
                }))
                .await
                .unwrap();
            order.lock().unwrap().push("table");
            outcome
        })
    };

    // Table summary queries are queued once the count query starts.
    wait_started(&engine, "count(*) AS count FROM \"orders\"").await;

    let model = {
        let (d, order) = (d.clone(), order.clone());
        tokio::spawn(async move {
            let outcome = d
                .dispatch(add_model("recent", "select * from orders"))
                .await
                .unwrap();
            order.lock().unwrap().push("model");
            outcome
        })
    };

    assert!(!table.await.unwrap().is_failed());
    assert!(!model.await.unwrap().is_failed());
    assert_eq!(*order.lock().unwrap(), vec!["model", "table"]);
    assert!(engine.last_finished("from orders") < engine.last_finished("\"orders\""));
}

#[tokio::test(start_paused = true)]
async fn test_activated_model_profiles_first() {
    let engine = ScriptedEngine::new();
    engine.relation("AS a_col", single_column("a_col", &[1, 2]));
    engine.relation("AS b_col", single_column("b_col", &[1, 2]));
    engine.delay("AS a_col", Duration::from_millis(10));
    engine.delay("AS b_col", Duration::from_millis(10));
    let d = dispatcher(engine.clone(), 1);

    d.dispatch(add_model("a", "")).await.unwrap();
    d.dispatch(add_model("b", "")).await.unwrap();
    let (a_id, b_id) = (model_id(&d, "a"), model_id(&d, "b"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let edit = |label: &'static str, id: String, query: &'static str| {
        let (d, order) = (d.clone(), order.clone());
        tokio::spawn(async move {
            d.dispatch(Action::UpdateModelQuery(UpdateModelQueryArgs {
                id,
                query: query.to_string(),
            }))
            .await
            .unwrap();
            order.lock().unwrap().push(label);
        })
    };

    let a = edit("a", a_id, "select 1 AS a_col");
    wait_started(&engine, "AS a_col").await;
    let b = edit("b", b_id.clone(), "select 1 AS b_col");

    d.dispatch(Action::SetActiveEntity(SetActiveEntityArgs {
        kind: EntityKind::Model,
        id: b_id.clone(),
    }))
    .await
    .unwrap();

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);

    // Activated before its summary ran, so b got the full profile.
    let model = d.store().get_entity_by_id::<DerivedModel>(&b_id).unwrap().unwrap();
    assert!(model.profile[0].histogram.is_some());
}
