//! Upload driver: retries, failures, readiness and concurrent batches.

mod common;

use canvas_sync::{
    run_upload, run_uploads, ContentKind, ImagePayload, Signal, SyncEngine, SyncError,
    UploadError, UploadPhase, UploadSource,
};
use common::{
    drain, fast_config, image_request, install_revoker, ready_engine, FakePreloader, FakeUploader,
};

fn failed_count(signals: &[Signal]) -> usize {
    signals
        .iter()
        .filter(|s| matches!(s, Signal::UploadFailed { .. }))
        .count()
}

#[tokio::test]
async fn test_failed_upload_keeps_local_preview() {
    let engine = ready_engine();
    let revoker = install_revoker(&engine);
    let mut rx = engine.borrow().subscribe();
    let uploader = FakeUploader::failing(10, UploadError::Network("connection reset".into()));
    let preloader = FakePreloader::new((64, 64));

    let result = run_upload(&engine, &uploader, &preloader, image_request("a.png", (64, 64))).await;
    assert!(matches!(result, Err(SyncError::Upload(UploadError::Network(_)))));
    assert_eq!(uploader.calls.get(), 2);
    assert!(preloader.requested.borrow().is_empty());

    let e = engine.borrow();
    let images = e.registry().images();
    assert_eq!(images.len(), 1);
    let image = &images[0];
    assert!(image.payload.pending_upload);
    assert!(image.payload.src.starts_with("blob:"));
    assert!(matches!(
        e.uploads().phase(&image.id),
        Some(UploadPhase::Failed { local: Some(_), .. })
    ));
    assert!(e.placeholders().is_empty());
    assert!(revoker.revoked().is_empty());

    assert_eq!(failed_count(&drain(&mut rx)), 1);
}

#[tokio::test]
async fn test_rejected_upload_is_not_retried() {
    let engine = ready_engine();
    let uploader = FakeUploader::failing(
        1,
        UploadError::Rejected {
            status: 403,
            message: "forbidden".into(),
        },
    );
    let preloader = FakePreloader::new((64, 64));

    let result = run_upload(&engine, &uploader, &preloader, image_request("a.png", (64, 64))).await;
    assert!(result.is_err());
    assert_eq!(uploader.calls.get(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let engine = ready_engine();
    let uploader = FakeUploader::failing(1, UploadError::Network("timeout".into()));
    let preloader = FakePreloader::new((64, 64));
    preloader.not_ready.set(2);

    let id = run_upload(&engine, &uploader, &preloader, image_request("a.png", (64, 64)))
        .await
        .expect("upload");
    assert_eq!(uploader.calls.get(), 2);
    assert_eq!(preloader.requested.borrow().len(), 3);
    let e = engine.borrow();
    assert!(e.uploads().phase(&id).is_none());
    assert_eq!(e.uploads().in_flight(), 0);
    assert!(!e.registry().get::<ImagePayload>(&id).expect("image").payload.pending_upload);
}

#[tokio::test]
async fn test_delete_during_upload_fails_it_and_revokes_preview() {
    let engine = ready_engine();
    let revoker = install_revoker(&engine);
    let mut rx = engine.borrow().subscribe();
    let uploader = FakeUploader {
        delete_pending: true,
        ..FakeUploader::observing(&engine)
    };
    let preloader = FakePreloader::new((64, 64));

    let result = run_upload(&engine, &uploader, &preloader, image_request("a.png", (64, 64))).await;
    assert!(result.is_err());
    assert!(preloader.requested.borrow().is_empty());

    let e = engine.borrow();
    assert!(e.registry().images().is_empty());
    assert_eq!(e.uploads().in_flight(), 0);
    assert!(e.local_refs().deferred().is_empty());
    assert_eq!(revoker.revoked(), vec!["blob:https://app.example.com/a.png"]);
    assert_eq!(failed_count(&drain(&mut rx)), 1);
}

#[tokio::test]
async fn test_unusable_receipt_fails_upload() {
    let engine = ready_engine();
    let revoker = install_revoker(&engine);
    let mut rx = engine.borrow().subscribe();
    let uploader = FakeUploader {
        empty_receipt: true,
        ..FakeUploader::default()
    };
    let preloader = FakePreloader::new((64, 64));

    let result = run_upload(&engine, &uploader, &preloader, image_request("a.png", (64, 64))).await;
    assert!(matches!(result, Err(SyncError::InvalidAsset(_))));

    let e = engine.borrow();
    assert_eq!(e.uploads().in_flight(), 0);
    let images = e.registry().images();
    let image = &images[0];
    assert!(matches!(
        e.uploads().phase(&image.id),
        Some(UploadPhase::Failed { local: Some(_), .. })
    ));
    assert!(image.payload.storage_key.is_none());
    assert_eq!(failed_count(&drain(&mut rx)), 1);
    // The preview is still rendered, so nothing is revoked yet.
    assert!(revoker.revoked().is_empty());
    let local = image.payload.src.clone();
    let id = image.id.clone();
    drop(e);

    engine
        .borrow_mut()
        .delete_content(ContentKind::Image, &id)
        .expect("delete");
    assert_eq!(revoker.revoked(), vec![local]);
}

#[tokio::test]
async fn test_unsupported_source_is_rejected_before_placement() {
    let engine = ready_engine();
    let uploader = FakeUploader::default();
    let preloader = FakePreloader::new((64, 64));
    let mut request = image_request("notes.txt", (64, 64));
    request.source = UploadSource::File {
        name: "notes.txt".into(),
        mime: "text/plain".into(),
        bytes: b"hello".to_vec(),
    };

    let result = run_upload(&engine, &uploader, &preloader, request).await;
    assert!(matches!(
        result,
        Err(SyncError::Upload(UploadError::Unsupported(_)))
    ));
    assert_eq!(uploader.calls.get(), 0);
    let e = engine.borrow();
    assert!(e.registry().images().is_empty());
    assert!(e.placeholders().is_empty());
    assert_eq!(e.uploads().in_flight(), 0);
}

#[tokio::test]
async fn test_upload_waits_for_scene() {
    let engine = SyncEngine::shared(fast_config());
    let uploader = FakeUploader::default();
    let preloader = FakePreloader::new((32, 32));

    let (result, ()) = futures::join!(
        run_upload(&engine, &uploader, &preloader, image_request("late.png", (32, 32))),
        async {
            tokio::task::yield_now().await;
            engine.borrow_mut().add_layer("layer-1", "Layer 1");
        }
    );
    let id = result.expect("upload");
    let e = engine.borrow();
    let image = e.registry().get::<ImagePayload>(&id).expect("image");
    assert_eq!(image.layer_id.as_deref(), Some("layer-1"));
    assert!(!image.payload.pending_upload);
}

#[tokio::test]
async fn test_batch_uploads_get_distinct_placements() {
    let engine = ready_engine();
    let mut rx = engine.borrow().subscribe();
    let uploader = FakeUploader::default();
    let preloader = FakePreloader::new((100, 100));

    let results = run_uploads(
        &engine,
        &uploader,
        &preloader,
        vec![image_request("a.png", (100, 100)), image_request("b.png", (100, 100))],
    )
    .await;
    let ids: Vec<String> = results.into_iter().map(|r| r.expect("upload")).collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let e = engine.borrow();
    let state = e.registry().state();
    let first = state.bounds_of(ContentKind::Image, &ids[0]).expect("first");
    let second = state.bounds_of(ContentKind::Image, &ids[1]).expect("second");
    assert!(!first.intersects(&second));

    let finished = drain(&mut rx)
        .iter()
        .filter(|s| {
            matches!(s, Signal::PlaceholderProgress { placeholder_id, progress }
                if ids.contains(placeholder_id) && (*progress - 1.0).abs() < f32::EPSILON)
        })
        .count();
    assert_eq!(finished, 2);
}
