#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use taskpool_core::domain::{ActorId, GroupId};
use taskpool_core::impls::SqliteTaskStore;

use common::{APPROVE, Harness, REVIEW, WF};

async fn file_backed() -> (Harness, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("taskpool.db").display());
    let store = SqliteTaskStore::connect(&url, 8).await.unwrap();
    (Harness::with_store(Arc::new(store)), dir)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_across_connections_have_one_winner() {
    let (h, _dir) = file_backed().await;
    let item = h.item().await;
    let group = GroupId::random();
    let actors: Vec<ActorId> = (0..12).map(|_| ActorId::random()).collect();
    for actor in &actors {
        h.directory.add_member(group, *actor).await;
    }
    h.service.open_step(item.id, WF, REVIEW, APPROVE, group).await.unwrap();

    let handles: Vec<_> = actors
        .iter()
        .map(|actor| {
            let service = h.service.clone();
            let (actor, item_id) = (*actor, item.id);
            tokio::spawn(async move { service.claim(actor, item_id, REVIEW, APPROVE).await })
        })
        .collect();

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(err) => assert!(err.is_already_claimed(), "unexpected error: {err}"),
        }
    }

    assert_eq!(won, 1);
    let tasks = h.service.find_by_item(item.id).await.unwrap();
    assert_eq!(tasks.claimed.len(), 1);
    assert!(tasks.pool.is_empty());
}

#[tokio::test]
async fn state_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("taskpool.db").display());
    let alice = ActorId::random();

    let item_id = {
        let h = Harness::with_store(Arc::new(SqliteTaskStore::open(&url).await.unwrap()));
        let item = h.item().await;
        h.service.open_step(item.id, WF, REVIEW, APPROVE, alice).await.unwrap();
        h.service.claim(alice, item.id, REVIEW, APPROVE).await.unwrap();
        item.id
    };

    let h = Harness::with_store(Arc::new(SqliteTaskStore::open(&url).await.unwrap()));
    assert_eq!(h.service.find_by_actor(alice).await.unwrap().len(), 1);
    assert_eq!(h.service.count_in_progress(item_id, REVIEW).await.unwrap(), 1);

    h.service.unwrap(item_id).await.unwrap();
    assert!(h.service.find_by_item(item_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn engaged_actions_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("taskpool.db").display());
    let group = GroupId::random();
    let alice = ActorId::random();

    let item_id = {
        let h = Harness::with_store(Arc::new(SqliteTaskStore::open(&url).await.unwrap()));
        h.directory.add_member(group, alice).await;
        let item = h.item().await;
        for action in [APPROVE, "comment"] {
            h.service.open_step(item.id, WF, REVIEW, action, group).await.unwrap();
            h.service.claim(alice, item.id, REVIEW, action).await.unwrap();
        }
        item.id
    };

    let h = Harness::with_store(Arc::new(SqliteTaskStore::open(&url).await.unwrap()));
    h.directory.add_member(group, alice).await;
    h.service.open_step(item_id, WF, REVIEW, APPROVE, group).await.unwrap();
    h.service.open_step(item_id, WF, REVIEW, "comment", group).await.unwrap();

    assert!(h.service.pool_for(alice).await.unwrap().is_empty());
    assert_eq!(h.service.count_in_progress(item_id, REVIEW).await.unwrap(), 1);
}
