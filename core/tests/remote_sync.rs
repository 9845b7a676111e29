mod common;

use common::{dispatcher, orders, ScriptedEngine};
use modelyard_core::actions::{Action, AddModelArgs};
use modelyard_core::config::SyncConfig;
use modelyard_core::state::{
    DerivedModel, EntityRecord, EntityStateStore, EntityStatus, PatchOrigin, PersistentModel,
};
use modelyard_core::sync::{
    duplex, LineTransport, LinkOptions, ProjectLayout, RemoteLink, SyncService, WireMessage,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

async fn converge<F: Fn() -> bool>(done: F) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replicas did not converge");
}

#[tokio::test]
async fn test_line_client_dispatches_and_receives_patches() {
    let engine = ScriptedEngine::new();
    engine.relation("from orders", orders());
    let d = dispatcher(engine, 2);
    let dir = TempDir::new().unwrap();
    let sync = SyncService::new(d.clone(), ProjectLayout::new(dir.path()), SyncConfig::default());

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let peer = sync.attach(Box::new(LineTransport::new("client", server_read, server_write)));
    assert_eq!(peer, "client");
    assert_eq!(sync.hub().len(), 1);

    let (client_read, mut client_write) = tokio::io::split(client_io);
    client_write
        .write_all(
            b"{\"action\":\"addModel\",\"args\":{\"name\":\"recent\",\"query\":\"select * from orders\"}}\n",
        )
        .await
        .unwrap();

    // Read until the model shows up idle in the derived stream.
    let mirror = EntityStateStore::new();
    let mut lines = BufReader::new(client_read).lines();
    let mut settled = false;
    while !settled {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("server went quiet")
            .unwrap()
            .expect("server closed the link");
        let WireMessage::Patches(batch) = WireMessage::from_line(&line).unwrap() else {
            panic!("server sent a dispatch envelope");
        };
        batch
            .apply(&mirror, PatchOrigin::Remote("server".into()))
            .unwrap();
        settled = mirror
            .get_current_state::<DerivedModel>()
            .unwrap()
            .iter()
            .any(|m| m.status == EntityStatus::Idle && m.cardinality == Some(3));
    }

    let models = mirror.get_current_state::<PersistentModel>().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "recent");
    assert_eq!(
        mirror.snapshot(PersistentModel::stream()),
        d.store().snapshot(PersistentModel::stream())
    );
    assert_eq!(sync.status().links[0].dispatched, 1);
}

#[tokio::test]
async fn test_new_link_starts_from_a_snapshot() {
    let engine = ScriptedEngine::new();
    engine.relation("from orders", orders());
    let d = dispatcher(engine, 2);
    d.dispatch(Action::AddModel(AddModelArgs {
        name: "recent".into(),
        query: "select * from orders".into(),
    }))
    .await
    .unwrap();

    let dir = TempDir::new().unwrap();
    let sync = SyncService::new(d.clone(), ProjectLayout::new(dir.path()), SyncConfig::default());
    let (server_side, client_side) = duplex("server", "viewer");
    sync.attach(Box::new(server_side));

    let viewer = EntityStateStore::new();
    let _link = RemoteLink::start(
        viewer.clone(),
        None,
        Box::new(client_side),
        LinkOptions {
            accept_dispatch: false,
            ..LinkOptions::default()
        },
    );

    converge(|| {
        viewer.snapshot(DerivedModel::stream()) == d.store().snapshot(DerivedModel::stream())
            && viewer.snapshot(PersistentModel::stream())
                == d.store().snapshot(PersistentModel::stream())
    })
    .await;
    assert_eq!(viewer.get_current_state::<PersistentModel>().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_lines_keep_link_open() {
    let d = dispatcher(ScriptedEngine::new(), 1);
    let dir = TempDir::new().unwrap();
    let sync = SyncService::new(d.clone(), ProjectLayout::new(dir.path()), SyncConfig::default());

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    sync.attach(Box::new(LineTransport::new("editor", server_read, server_write)));
    let (_client_read, mut client_write) = tokio::io::split(client_io);

    let model = json!({
        "id": "m1",
        "name": "recent",
        "query": "select 1",
        "fileName": "recent.sql",
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": "2024-01-01T00:00:00Z",
    });
    let input = [
        "not json".to_string(),
        // Not a JSON pointer: rejected by the store.
        json!({
            "entityKind": "model",
            "stateKind": "persistent",
            "patches": [{"op": "replace", "path": "m1/query", "value": "select 2"}],
        })
        .to_string(),
        json!({
            "entityKind": "model",
            "stateKind": "persistent",
            "patches": [{"op": "add", "path": "/m1", "value": model}],
        })
        .to_string(),
    ];
    for line in input {
        client_write.write_all(line.as_bytes()).await.unwrap();
        client_write.write_all(b"\n").await.unwrap();
    }

    converge(|| {
        d.store()
            .get_entity_by_id::<PersistentModel>("m1")
            .unwrap()
            .is_some()
    })
    .await;
    let status = sync.status();
    assert_eq!(status.links.len(), 1);
    assert_eq!(status.links[0].received_batches, 2);
    assert!(!status.links[0].closed);
}

#[tokio::test]
async fn test_late_remote_batch_is_dropped() {
    let d = dispatcher(ScriptedEngine::new(), 1);
    let dir = TempDir::new().unwrap();
    let sync = SyncService::new(d.clone(), ProjectLayout::new(dir.path()), SyncConfig::default());

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    sync.attach(Box::new(LineTransport::new("editor", server_read, server_write)));
    let (_client_read, mut client_write) = tokio::io::split(client_io);

    let model = json!({
        "id": "m1",
        "name": "recent",
        "query": "select 1",
        "fileName": "recent.sql",
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": "2024-01-01T00:00:00Z",
    });
    let batch = |version: u64, patches: serde_json::Value| {
        json!({
            "entityKind": "model",
            "stateKind": "persistent",
            "version": version,
            "patches": patches,
        })
        .to_string()
    };
    let add = batch(1, json!([{"op": "add", "path": "/m1", "value": model}]));
    let input = [
        add.clone(),
        batch(2, json!([{"op": "replace", "path": "/m1/query", "value": "select 2"}])),
        // redelivered after the edit
        add,
        batch(3, json!([{"op": "replace", "path": "/m1/name", "value": "renamed"}])),
    ];
    for line in input {
        client_write.write_all(line.as_bytes()).await.unwrap();
        client_write.write_all(b"\n").await.unwrap();
    }

    converge(|| {
        d.store()
            .get_entity_by_id::<PersistentModel>("m1")
            .unwrap()
            .is_some_and(|m| m.name == "renamed")
    })
    .await;
    let m1 = d
        .store()
        .get_entity_by_id::<PersistentModel>("m1")
        .unwrap()
        .unwrap();
    assert_eq!(m1.query, "select 2");
    assert_eq!(sync.status().links[0].received_batches, 4);
}
