mod common;

use bytes::Bytes;
use common::{USER, harness_with_sessions, patterned, yielding_harness};
use media_upload::{
    codec, db,
    models::upload::{ChunkRequest, InitializeRequest},
    policy::MIB,
    services::UploadError,
    sessions::{SessionStore, SqliteSessionStore},
    store::StoreOp,
};
use std::sync::Arc;

async fn sqlite_sessions(url: &str) -> Arc<SqliteSessionStore> {
    let pool = db::connect(url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteSessionStore::new(Arc::new(pool)))
}

fn request() -> InitializeRequest {
    InitializeRequest {
        file_name: "walkthrough.mp4".into(),
        file_type: "video/mp4".into(),
        file_size: 12 * MIB,
        folder: "videos".into(),
        access_level: None,
    }
}

#[tokio::test]
async fn protocol_runs_on_a_shared_session_store() {
    let sessions = sqlite_sessions("sqlite::memory:").await;
    let (service, store) = harness_with_sessions(sessions.clone());

    let init = service.initialize(USER, request()).await.unwrap();
    assert_eq!(init.total_chunks, 3);
    let data = Bytes::from(patterned(3000));
    for (part_number, body) in codec::split(&data, 1000) {
        let resp = service
            .upload_chunk(
                USER,
                ChunkRequest {
                    session_id: init.session_id.clone(),
                    base64_data: codec::encode_chunk(&body),
                    part_number,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.parts_uploaded, part_number as usize);
    }
    assert_eq!(sessions.count().await.unwrap(), 1);

    let (a, b) = tokio::join!(
        service.complete(USER, &init.session_id),
        service.complete(USER, &init.session_id)
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(store.calls(StoreOp::CompleteMultipartUpload), 1);
    assert_eq!(sessions.count().await.unwrap(), 0);
}

#[tokio::test]
async fn interleaved_completions_claim_the_row_once() {
    let sessions = sqlite_sessions("sqlite::memory:").await;
    let (service, store) = yielding_harness(sessions.clone());

    let init = service.initialize(USER, request()).await.unwrap();
    let body = Bytes::from(patterned(1000));
    service
        .upload_chunk(
            USER,
            ChunkRequest {
                session_id: init.session_id.clone(),
                base64_data: codec::encode_chunk(&body),
                part_number: 1,
            },
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.complete(USER, &init.session_id),
        service.complete(USER, &init.session_id)
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1, "{:?}", outcomes);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(UploadError::SessionNotFound))),
        "{:?}",
        outcomes
    );
    assert_eq!(store.calls(StoreOp::CompleteMultipartUpload), 1);
    assert_eq!(sessions.count().await.unwrap(), 0);
}

#[tokio::test]
async fn sessions_survive_a_service_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("sessions.db").display());

    let first = sqlite_sessions(&url).await;
    let (service, store) = harness_with_sessions(first);
    let init = service.initialize(USER, request()).await.unwrap();
    drop(service);

    // A second instance over the same database sees the session.
    let second = sqlite_sessions(&url).await;
    let restarted = media_upload::services::UploadService::new(
        store.clone(),
        second,
        common::location(),
    );
    let status = restarted.status(USER, &init.session_id).await.unwrap();
    assert_eq!(status.upload_id, init.upload_id);

    let err = restarted.status("someone-else", &init.session_id).await.unwrap_err();
    assert!(matches!(err, UploadError::NotSessionOwner));
    assert!(restarted.abort(USER, &init.session_id).await.unwrap().success);
    assert_eq!(store.pending_uploads(), 0);
}
