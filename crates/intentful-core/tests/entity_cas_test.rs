// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compare-and-swap spec writes and graveyard recreation rules.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{MockBehaviour, TestContext};
use intentful_core::entity_handlers::{self, UpdateSpecRequest, UpdateStatusRequest};
use intentful_core::error::CoreError;
use intentful_core::model::MetadataSeed;
use intentful_core::persistence::{Persistence, SqlitePersistence, WatcherFilter};

#[tokio::test]
async fn test_stale_spec_write_conflicts_without_side_effects() {
    let ctx = TestContext::new(MockBehaviour::ApplySpec).await;
    let entity = ctx.create("Location", json!({"x": 1, "y": 1})).await;
    let entity_ref = entity.metadata.reference();

    entity_handlers::handle_update_spec(
        &ctx.state,
        UpdateSpecRequest {
            entity_ref: entity_ref.clone(),
            spec_version: 1,
            spec: json!({"x": 2, "y": 1}),
            user_info: None,
        },
    )
    .await
    .unwrap();

    let err = entity_handlers::handle_update_spec(
        &ctx.state,
        UpdateSpecRequest {
            entity_ref: entity_ref.clone(),
            spec_version: 1,
            spec: json!({"x": 3, "y": 1}),
            user_info: None,
        },
    )
    .await
    .unwrap_err();

    match &err {
        CoreError::ConflictingEntity {
            expected_spec_version,
            current,
            ..
        } => {
            assert_eq!(*expected_spec_version, 1);
            assert_eq!(current.metadata.spec_version, 2);
            assert_eq!(current.spec, json!({"x": 2, "y": 1}));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(err.error_code(), "CONFLICTING_ENTITY");

    // Only the winning write started a watcher.
    let watchers = ctx
        .persistence
        .list_watchers(&WatcherFilter {
            entity_uuid: Some(entity_ref.uuid),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(watchers.len(), 1);
    assert_eq!(watchers[0].spec_version, 2);
}

#[tokio::test]
async fn test_conflicting_write_on_converged_entity_creates_no_watcher() {
    let ctx = TestContext::new(MockBehaviour::ApplySpec).await;
    let entity = ctx.create("Location", json!({"x": 1, "y": 1})).await;
    let entity_ref = entity.metadata.reference();

    let err = entity_handlers::handle_update_spec(
        &ctx.state,
        UpdateSpecRequest {
            entity_ref: entity_ref.clone(),
            spec_version: 0,
            spec: json!({"x": 9, "y": 9}),
            user_info: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::ConflictingEntity { .. }));

    let stored = ctx.persistence.get_entity(&entity_ref).await.unwrap();
    assert_eq!(stored.spec, json!({"x": 1, "y": 1}));
    assert_eq!(stored.metadata.spec_version, 1);
    assert!(
        ctx.persistence
            .list_watchers(&WatcherFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(
        SqlitePersistence::from_path(dir.path().join("cas.db"))
            .await
            .unwrap(),
    );
    let ctx = Arc::new(TestContext::with_persistence(persistence, MockBehaviour::ApplySpec).await);
    let entity = ctx.create("Location", json!({"x": 0, "y": 0})).await;
    let entity_ref = entity.metadata.reference();

    let writers = (1..=8).map(|x| {
        let ctx = ctx.clone();
        let entity_ref = entity_ref.clone();
        async move {
            entity_handlers::handle_update_spec(
                &ctx.state,
                UpdateSpecRequest {
                    entity_ref,
                    spec_version: 1,
                    spec: json!({"x": x, "y": 0}),
                    user_info: None,
                },
            )
            .await
        }
    });
    let results = futures::future::join_all(writers).await;

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(
                matches!(err, CoreError::ConflictingEntity { .. }),
                "unexpected error: {:?}",
                err
            );
        }
    }

    let stored = ctx.persistence.get_entity(&entity_ref).await.unwrap();
    assert_eq!(stored.metadata.spec_version, 2);
    assert_eq!(stored.spec, winners[0].spec);
}

async fn file_backed_context(name: &str) -> (tempfile::TempDir, Arc<TestContext>) {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(
        SqlitePersistence::from_path(dir.path().join(name))
            .await
            .unwrap(),
    );
    let ctx = Arc::new(TestContext::with_persistence(persistence, MockBehaviour::ApplySpec).await);
    (dir, ctx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_status_updates_all_apply() {
    let (_dir, ctx) = file_backed_context("status.db").await;
    let entity = ctx.create("Location", json!({"x": 0, "y": 0})).await;
    let entity_ref = entity.metadata.reference();
    ctx.reconciler.run_once().await.unwrap();

    for round in 0..4 {
        let writers = (0..8).map(|i| {
            let ctx = ctx.clone();
            let entity_ref = entity_ref.clone();
            let mut status = serde_json::Map::new();
            status.insert(format!("sensor_{}", i), json!(round));
            tokio::spawn(async move {
                entity_handlers::handle_update_status(
                    &ctx.state,
                    UpdateStatusRequest {
                        entity_ref,
                        status: status.into(),
                    },
                )
                .await
            })
        });
        for result in futures::future::join_all(writers).await {
            result.unwrap().expect("concurrent status update succeeds");
        }
    }

    let stored = ctx.persistence.get_entity(&entity_ref).await.unwrap();
    for i in 0..8 {
        assert_eq!(stored.status[format!("sensor_{}", i)], json!(3));
    }
    assert_eq!(stored.status["x"], json!(0));
    assert!(ctx.persistence.get_watchlist().await.unwrap().contains(&entity_ref));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_of_one_uuid_conflict() {
    let (_dir, ctx) = file_backed_context("create.db").await;
    let uuid = uuid::Uuid::new_v4();

    let creators = (0..4).map(|i| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            ctx.create_with_seed(
                "Location",
                MetadataSeed {
                    uuid: Some(uuid),
                    ..Default::default()
                },
                json!({"x": i, "y": 0}),
            )
            .await
        })
    });
    let results: Vec<_> = futures::future::join_all(creators)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    for result in &results {
        if let Err(err) = result {
            match err {
                CoreError::ConflictingEntity { current, .. } => {
                    assert_eq!(current.metadata.uuid, uuid);
                    assert_eq!(current.spec, created[0].spec);
                }
                other => panic!("expected conflict, got {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn test_graveyard_blocks_recreation_at_or_below_highest_version() {
    let ctx = TestContext::new(MockBehaviour::ApplySpec).await;
    let entity = ctx.create("Location", json!({"x": 1, "y": 1})).await;
    let entity_ref = entity.metadata.reference();

    entity_handlers::handle_update_spec(
        &ctx.state,
        UpdateSpecRequest {
            entity_ref: entity_ref.clone(),
            spec_version: 1,
            spec: json!({"x": 2, "y": 1}),
            user_info: None,
        },
    )
    .await
    .unwrap();

    let record = entity_handlers::handle_delete_entity(&ctx.state, &entity_ref)
        .await
        .unwrap();
    assert_eq!(record.highest_spec_version, 2);
    assert!(record.entity.metadata.deleted_at.is_some());

    let err = entity_handlers::handle_get_entity(&ctx.state, &entity_ref)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ENTITY_NOT_FOUND");

    for requested in [1, 2] {
        let err = ctx
            .create_with_seed(
                "Location",
                MetadataSeed {
                    uuid: Some(entity_ref.uuid),
                    spec_version: Some(requested),
                    ..Default::default()
                },
                json!({"x": 5, "y": 5}),
            )
            .await
            .unwrap_err();
        match err {
            CoreError::GraveyardConflictingEntity {
                highest_spec_version,
                ..
            } => assert_eq!(highest_spec_version, 2),
            other => panic!("expected graveyard conflict, got {:?}", other),
        }
    }

    // Without a version the request counts as version 0.
    let err = ctx
        .create_with_seed(
            "Location",
            MetadataSeed {
                uuid: Some(entity_ref.uuid),
                ..Default::default()
            },
            json!({"x": 5, "y": 5}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "GRAVEYARD_CONFLICTING_ENTITY");

    let recreated = ctx
        .create_with_seed(
            "Location",
            MetadataSeed {
                uuid: Some(entity_ref.uuid),
                spec_version: Some(3),
                ..Default::default()
            },
            json!({"x": 5, "y": 5}),
        )
        .await
        .unwrap();
    assert_eq!(recreated.metadata.uuid, entity_ref.uuid);
    assert_eq!(recreated.metadata.spec_version, 4);

    let record = entity_handlers::handle_delete_entity(&ctx.state, &entity_ref)
        .await
        .unwrap();
    assert_eq!(record.highest_spec_version, 4);
}

#[tokio::test]
async fn test_create_with_taken_uuid_conflicts() {
    let ctx = TestContext::new(MockBehaviour::ApplySpec).await;
    let entity = ctx.create("Location", json!({"x": 1, "y": 1})).await;

    let err = ctx
        .create_with_seed(
            "Location",
            MetadataSeed {
                uuid: Some(entity.metadata.uuid),
                ..Default::default()
            },
            json!({"x": 2, "y": 2}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ConflictingEntity { .. }));
}
