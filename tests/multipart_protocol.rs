mod common;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use common::{BUCKET, REGION, USER, harness, patterned, scaled_harness, yielding_harness};
use media_upload::{
    codec,
    models::{
        multipart::UploadSession,
        upload::{ChunkRequest, InitializeRequest},
    },
    policy::MIB,
    services::UploadError,
    sessions::{MemorySessionStore, SessionStore},
    store::{ObjectStore, StoreOp},
};
use std::{collections::BTreeMap, sync::Arc};

fn init_request(name: &str, mime: &str, size: u64, folder: &str) -> InitializeRequest {
    InitializeRequest {
        file_name: name.into(),
        file_type: mime.into(),
        file_size: size,
        folder: folder.into(),
        access_level: None,
    }
}

fn chunk(session_id: &str, part_number: u32, data: &[u8]) -> ChunkRequest {
    ChunkRequest {
        session_id: session_id.into(),
        base64_data: codec::encode_chunk(data),
        part_number,
    }
}

#[tokio::test]
async fn video_session_runs_from_initialize_to_public_url() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("video.mp4", "video/mp4", 250_000_000, "videos"))
        .await
        .unwrap();

    assert_eq!(init.chunk_size, 10 * MIB);
    // ceil(250_000_000 / 10 MiB)
    assert_eq!(init.total_chunks, 24);
    assert_eq!(init.bucket_name, BUCKET);
    assert_eq!(init.region, REGION);

    for part in 1..=init.total_chunks {
        let resp = h
            .service
            .upload_chunk(USER, chunk(&init.session_id, part, &[part as u8; 16]))
            .await
            .unwrap();
        assert_eq!(resp.chunk_number, part);
        assert_eq!(resp.parts_uploaded, part as usize);
    }

    let done = h.service.complete(USER, &init.session_id).await.unwrap();
    let prefix = format!(
        "https://{}.s3.{}.amazonaws.com/public/products/{}/videos/",
        BUCKET, REGION, USER
    );
    assert!(done.url.starts_with(&prefix), "{}", done.url);
    assert!(done.url.ends_with(".mp4"));
    assert_eq!(done.url, done.location);
    assert!(done.url.ends_with(&done.key));

    assert_eq!(h.sessions.count().await.unwrap(), 0);
    assert_eq!(h.store.calls(StoreOp::CompleteMultipartUpload), 1);
    assert_eq!(
        h.store.object_bytes(&done.key).unwrap().len(),
        16 * init.total_chunks as usize
    );
}

#[tokio::test]
async fn oversized_file_is_rejected_before_any_session() {
    let h = harness();
    let err = h
        .service
        .initialize(USER, init_request("huge.mp4", "video/mp4", 6_000_000_000, "videos"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("exceeds 5GB limit"), "{}", err);
    assert_eq!(err.status().as_u16(), 413);
    assert_eq!(h.store.total_calls(), 0);
    assert_eq!(h.sessions.count().await.unwrap(), 0);
}

#[tokio::test]
async fn type_must_match_the_folder() {
    let h = harness();
    let err = h
        .service
        .initialize(USER, init_request("a.pdf", "application/pdf", 20 * MIB, "images"))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 415);

    let err = h
        .service
        .initialize(USER, init_request("a.exe", "application/x-msdownload", MIB, "misc"))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 415);
    assert_eq!(h.store.total_calls(), 0);
}

#[tokio::test]
async fn chunk_for_unknown_session_never_reaches_the_store() {
    let h = harness();
    let err = h
        .service
        .upload_chunk(USER, chunk("never-issued", 1, b"data"))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::SessionNotFound));
    assert_eq!(err.to_string(), "Upload session not found or expired");
    assert_eq!(h.store.calls(StoreOp::UploadPart), 0);
}

#[tokio::test]
async fn abort_is_idempotent() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("clip.webm", "video/webm", 30 * MIB, "videos"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"part one"))
        .await
        .unwrap();

    assert!(h.service.abort(USER, &init.session_id).await.unwrap().success);
    assert!(h.service.abort(USER, &init.session_id).await.unwrap().success);
    assert!(h.service.abort(USER, "no-such-session").await.unwrap().success);

    assert_eq!(h.store.pending_uploads(), 0);
    assert_eq!(h.store.calls(StoreOp::AbortMultipartUpload), 1);
    let err = h
        .service
        .upload_chunk(USER, chunk(&init.session_id, 2, b"late"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SessionNotFound));
}

#[tokio::test]
async fn complete_without_parts_fails_and_keeps_the_session() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("doc.pdf", "application/pdf", 12 * MIB, "documents"))
        .await
        .unwrap();

    let err = h.service.complete(USER, &init.session_id).await.unwrap_err();
    assert!(matches!(err, UploadError::NoParts));
    assert_eq!(err.to_string(), "No parts uploaded");
    assert_eq!(h.store.calls(StoreOp::CompleteMultipartUpload), 0);

    // The caller can still upload and finish.
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"%PDF"))
        .await
        .unwrap();
    h.service.complete(USER, &init.session_id).await.unwrap();
}

#[tokio::test]
async fn only_the_owner_may_touch_a_session() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("pic.png", "image/png", 11 * MIB, "images"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"png"))
        .await
        .unwrap();

    let intruder = "user-2";
    let err = h
        .service
        .upload_chunk(intruder, chunk(&init.session_id, 2, b"evil"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::NotSessionOwner));
    assert!(matches!(
        h.service.complete(intruder, &init.session_id).await,
        Err(UploadError::NotSessionOwner)
    ));
    assert!(matches!(
        h.service.abort(intruder, &init.session_id).await,
        Err(UploadError::NotSessionOwner)
    ));
    assert!(matches!(
        h.service.status(intruder, &init.session_id).await,
        Err(UploadError::NotSessionOwner)
    ));

    assert_eq!(h.store.calls(StoreOp::UploadPart), 1);
    assert_eq!(h.sessions.count().await.unwrap(), 1);
    h.service.complete(USER, &init.session_id).await.unwrap();
}

#[tokio::test]
async fn expired_sessions_are_swept_on_initialize() {
    let h = harness();
    let key = "public/products/user-1/videos/stale.mp4";
    let upload_id = h
        .store
        .create_multipart_upload(key, Some("video/mp4"))
        .await
        .unwrap();
    h.sessions
        .insert(UploadSession {
            session_id: "stale".into(),
            upload_id,
            key: key.into(),
            user_id: USER.into(),
            content_type: "video/mp4".into(),
            file_size: 20 * MIB,
            chunk_size: 5 * MIB,
            total_chunks: 4,
            parts: BTreeMap::new(),
            created_at: Utc::now() - ChronoDuration::hours(25),
        })
        .await
        .unwrap();

    // Still reachable until the next initialize runs.
    assert!(h.service.status(USER, "stale").await.is_ok());

    h.service
        .initialize(USER, init_request("new.mp4", "video/mp4", 20 * MIB, "videos"))
        .await
        .unwrap();

    let err = h
        .service
        .upload_chunk(USER, chunk("stale", 1, b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SessionNotFound));
    assert_eq!(h.sessions.count().await.unwrap(), 1);
    // The stale store-side upload was released; only the new one remains.
    assert_eq!(h.store.calls(StoreOp::AbortMultipartUpload), 1);
    assert_eq!(h.store.pending_uploads(), 1);
}

#[tokio::test]
async fn rejected_initialize_still_sweeps() {
    let h = harness();
    let key = "public/products/user-1/documents/stale.pdf";
    let upload_id = h
        .store
        .create_multipart_upload(key, Some("application/pdf"))
        .await
        .unwrap();
    h.sessions
        .insert(UploadSession {
            session_id: "stale".into(),
            upload_id,
            key: key.into(),
            user_id: USER.into(),
            content_type: "application/pdf".into(),
            file_size: 12 * MIB,
            chunk_size: 5 * MIB,
            total_chunks: 3,
            parts: BTreeMap::new(),
            created_at: Utc::now() - ChronoDuration::hours(30),
        })
        .await
        .unwrap();

    let err = h
        .service
        .initialize(USER, init_request("huge.mp4", "video/mp4", 6 * 1024 * MIB, "videos"))
        .await
        .unwrap_err();
    assert_eq!(err.status().as_u16(), 413);

    assert_eq!(h.sessions.count().await.unwrap(), 0);
    assert_eq!(h.store.calls(StoreOp::AbortMultipartUpload), 1);
    assert_eq!(h.store.pending_uploads(), 0);
    assert_eq!(h.store.calls(StoreOp::CreateMultipartUpload), 1);
}

#[tokio::test]
async fn racing_completions_finish_once() {
    // The store yields inside completion, so the second call runs while the
    // first one is still waiting on the store.
    let (service, store) = yielding_harness(Arc::new(MemorySessionStore::new()));
    let init = service
        .initialize(USER, init_request("a.mov", "video/quicktime", 40 * MIB, "videos"))
        .await
        .unwrap();
    service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"moov"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.complete(USER, &init.session_id),
        service.complete(USER, &init.session_id)
    );
    let outcomes = [a, b];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "{:?}", outcomes);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(UploadError::SessionNotFound))),
        "{:?}",
        outcomes
    );
    assert_eq!(store.calls(StoreOp::CompleteMultipartUpload), 1);
    assert_eq!(store.pending_uploads(), 0);
}

#[tokio::test]
async fn failed_completion_aborts_the_remote_upload() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("b.mp4", "video/mp4", 15 * MIB, "videos"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"frames"))
        .await
        .unwrap();

    h.store.fail(StoreOp::CompleteMultipartUpload);
    let err = h.service.complete(USER, &init.session_id).await.unwrap_err();
    assert!(matches!(err, UploadError::Store(_)));
    assert_eq!(err.status().as_u16(), 502);

    assert_eq!(h.store.calls(StoreOp::AbortMultipartUpload), 1);
    assert_eq!(h.store.pending_uploads(), 0);
    assert_eq!(h.sessions.count().await.unwrap(), 0);
}

#[tokio::test]
async fn compensation_retries_and_keeps_the_original_error() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("c.mp4", "video/mp4", 15 * MIB, "videos"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"frames"))
        .await
        .unwrap();

    h.store.fail(StoreOp::CompleteMultipartUpload);
    h.store.fail(StoreOp::AbortMultipartUpload);
    let err = h.service.complete(USER, &init.session_id).await.unwrap_err();

    assert!(err.to_string().contains("CompleteMultipartUpload"), "{}", err);
    assert_eq!(h.store.calls(StoreOp::AbortMultipartUpload), 3);
    assert_eq!(h.store.pending_uploads(), 1);
}

#[tokio::test]
async fn parts_uploaded_out_of_order_reassemble_in_order() {
    let h = scaled_harness();
    let data = Bytes::from(patterned(48 * 1024 + 123));
    let init = h
        .service
        .initialize(
            USER,
            init_request("scan.pdf", "application/pdf", data.len() as u64, "documents"),
        )
        .await
        .unwrap();
    let parts = codec::split(&data, init.chunk_size);
    assert_eq!(parts.len(), init.total_chunks as usize);

    for (part_number, body) in parts.iter().rev() {
        h.service
            .upload_chunk(USER, chunk(&init.session_id, *part_number, body))
            .await
            .unwrap();
    }
    let status = h.service.status(USER, &init.session_id).await.unwrap();
    assert_eq!(status.parts_uploaded, parts.len());
    assert_eq!(status.parts[0].part_number, 1);
    assert_eq!(status.parts[0].size, init.chunk_size);

    let done = h.service.complete(USER, &init.session_id).await.unwrap();
    assert_eq!(h.store.object_bytes(&done.key).unwrap(), data);
}

#[tokio::test]
async fn malformed_chunks_are_rejected() {
    let h = scaled_harness();
    let init = h
        .service
        .initialize(USER, init_request("a.png", "image/png", 20 * 1024, "images"))
        .await
        .unwrap();

    let past_end = h
        .service
        .upload_chunk(USER, chunk(&init.session_id, init.total_chunks + 1, b"x"))
        .await
        .unwrap_err();
    assert_eq!(past_end.status().as_u16(), 400);

    let too_big = vec![0u8; init.chunk_size as usize + 1];
    let oversized = h
        .service
        .upload_chunk(USER, chunk(&init.session_id, 1, &too_big))
        .await
        .unwrap_err();
    assert_eq!(oversized.status().as_u16(), 400);

    let mut bad = chunk(&init.session_id, 1, b"x");
    bad.base64_data = "***".into();
    let err = h.service.upload_chunk(USER, bad).await.unwrap_err();
    assert!(matches!(err, UploadError::Codec(_)));
    assert_eq!(h.store.calls(StoreOp::UploadPart), 0);
}

#[tokio::test]
async fn status_reports_parts_held_by_the_store() {
    let h = harness();
    let init = h
        .service
        .initialize(USER, init_request("v.mkv", "video/x-matroska", 60 * MIB, "videos"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 3, b"third"))
        .await
        .unwrap();
    h.service
        .upload_chunk(USER, chunk(&init.session_id, 1, b"first"))
        .await
        .unwrap();

    let status = h.service.status(USER, &init.session_id).await.unwrap();
    assert_eq!(status.upload_id, init.upload_id);
    assert_eq!(status.key, init.key);
    assert_eq!(status.parts_uploaded, 2);
    let numbers: Vec<u32> = status.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 3]);
    assert_eq!(h.store.calls(StoreOp::ListParts), 1);
}
