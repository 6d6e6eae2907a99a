//! Upload engine integration tests against an in-process S3-style server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use tokio::net::TcpListener;

use portico_core::permissions;
use portico_driver_api::{MultipartStrategy, PartRecord, PartsLedgerPolicy};
use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
use portico_storage::{SecretsCrypto, db, index_repo, storage_configs_repo};
use portico_vfs::cache::DirectoryCache;
use portico_vfs::link::UrlSigner;
use portico_vfs::meta::PathTokenSigner;
use portico_vfs::{FsService, Viewer};

use super::sessions::SessionManager;
use super::{Strategy, UploadEngine, select_strategy};

#[derive(Clone, Default)]
struct MockS3 {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    parts: HashMap<u32, usize>,
    put_attempts: HashMap<u32, u32>,
    /// Part numbers whose first PUT is rejected with a 403 "expired".
    expire_first: Vec<u32>,
    completed_parts: Option<Vec<u32>>,
    objects: HashMap<String, usize>,
}

async fn mock_s3_handler(
    State(mock): State<MockS3>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    let body = axum::body::to_bytes(req.into_body(), 64 * 1024 * 1024)
        .await
        .unwrap_or_default();

    let mut state = mock.inner.lock().unwrap();
    match method {
        Method::POST if query.contains_key("uploads") => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            "<InitiateMultipartUploadResult><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>",
        )
            .into_response(),
        Method::PUT if query.contains_key("partNumber") => {
            let part: u32 = query["partNumber"].parse().unwrap();
            let attempts = state.put_attempts.entry(part).or_insert(0);
            *attempts += 1;
            if *attempts == 1 && state.expire_first.contains(&part) {
                return (StatusCode::FORBIDDEN, "Request signature expired").into_response();
            }
            state.parts.insert(part, body.len());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ETAG, format!("\"e{part}\""))
                .body(Body::empty())
                .unwrap()
        }
        Method::POST if query.contains_key("uploadId") => {
            let text = String::from_utf8_lossy(&body);
            let mut listed: Vec<u32> = state.parts.keys().copied().collect();
            listed.sort_unstable();
            for part in &listed {
                if !text.contains(&format!("<PartNumber>{part}</PartNumber>")) {
                    return (StatusCode::BAD_REQUEST, "InvalidPartOrder").into_response();
                }
            }
            let total: usize = state.parts.values().sum();
            state.completed_parts = Some(listed);
            state.objects.insert(key.clone(), total);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml")],
                "<CompleteMultipartUploadResult><ETag>\"final\"</ETag></CompleteMultipartUploadResult>",
            )
                .into_response()
        }
        Method::GET if query.contains_key("uploadId") => {
            let mut xml = String::from("<ListPartsResult>");
            let mut listed: Vec<(u32, usize)> =
                state.parts.iter().map(|(k, v)| (*k, *v)).collect();
            listed.sort_unstable();
            for (part, size) in listed {
                xml.push_str(&format!(
                    "<Part><PartNumber>{part}</PartNumber><ETag>\"e{part}\"</ETag><Size>{size}</Size></Part>"
                ));
            }
            xml.push_str("<IsTruncated>false</IsTruncated></ListPartsResult>");
            (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], xml).into_response()
        }
        Method::DELETE if query.contains_key("uploadId") => {
            state.parts.clear();
            StatusCode::NO_CONTENT.into_response()
        }
        Method::HEAD => match state.objects.get(&key) {
            Some(size) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, *size)
                .header(header::ETAG, "\"obj\"")
                .body(Body::empty())
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::PUT => {
            state.objects.insert(key.clone(), body.len());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ETAG, "\"obj\"")
                .body(Body::empty())
                .unwrap()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

struct Harness {
    engine: UploadEngine,
    fs: Arc<FsService>,
    mock: MockS3,
    _tmp: tempfile::TempDir,
}

async fn harness(expire_first: Vec<u32>) -> Harness {
    let mock = MockS3::default();
    mock.inner.lock().unwrap().expire_first = expire_first;

    let app = Router::new()
        .route("/bucket/{*key}", any(mock_s3_handler))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let tmp = tempfile::TempDir::new().unwrap();
    let pool = db::init_in_memory().await.unwrap();
    let config = storage_configs_repo::create(
        &pool,
        "s3",
        "s3",
        None,
        serde_json::json!({
            "endpoint": format!("http://{addr}"),
            "region": "us-east-1",
            "bucket": "bucket",
            "access_key_id": "ak",
            "secret_access_key": "sk",
        }),
        String::new(),
        "",
        false,
        None,
    )
    .await
    .unwrap();
    mounts_repo::create(
        &pool,
        NewMount {
            name: "s3".to_string(),
            mount_path: "/s3".to_string(),
            storage_config_id: config.id,
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Redirect302,
            enable_sign: false,
            sign_expires_sec: None,
        },
    )
    .await
    .unwrap();

    let fs = Arc::new(FsService::new(
        pool.clone(),
        Arc::new(portico_driver_registry::DriverRegistry::new()),
        Arc::new(SecretsCrypto::load_or_create(tmp.path()).unwrap()),
        Arc::new(DirectoryCache::new()),
        Arc::new(PathTokenSigner::new(b"t".to_vec())),
        Arc::new(UrlSigner::new(b"s".to_vec())),
    ));
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(3600)));
    let engine = UploadEngine::new(pool, fs.clone(), sessions);
    Harness {
        engine,
        fs,
        mock,
        _tmp: tmp,
    }
}

fn admin() -> Viewer {
    Viewer::Admin {
        admin_id: "a".to_string(),
    }
}

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn per_part_url_multipart_end_to_end() {
    let h = harness(Vec::new()).await;
    let viewer = admin();
    let size = 12 * MIB + MIB / 2;

    let init = h
        .engine
        .init_multipart(&viewer, "/s3/big.bin", size, "application/octet-stream", None, None)
        .await
        .unwrap();
    assert_eq!(init.strategy, MultipartStrategy::PerPartUrl);
    assert_eq!(init.total_parts, 3);
    assert_eq!(init.part_size, 5 * MIB);
    assert_eq!(
        init.policy.parts_ledger_policy,
        PartsLedgerPolicy::ServerCanList
    );
    // Batched signing hands out the first window at init.
    assert!(!init.presigned_urls.is_empty());

    let mut incoming = Vec::new();
    for part in 1..=3u32 {
        let len = if part == 3 { (MIB / 2) as usize } else { (5 * MIB) as usize };
        let chunk = h
            .engine
            .upload_chunk(&viewer, &init.file_id, part, Bytes::from(vec![7u8; len]))
            .await
            .unwrap();
        let etag = chunk.etag.expect("etag from backend");
        assert_eq!(etag, format!("\"e{part}\""));
        incoming.push(PartRecord {
            part_number: part,
            etag: Some(etag),
            size: len as u64,
        });
    }

    let done = h
        .engine
        .complete(&viewer, &init.file_id, &incoming)
        .await
        .unwrap();
    assert_eq!(done.path, "/s3/big.bin");

    // Session is gone and the backend saw a contiguous 1..3 completion.
    assert!(!h.engine.sessions.contains(&init.file_id));
    let state = h.mock.inner.lock().unwrap();
    assert_eq!(state.completed_parts.as_deref(), Some(&[1, 2, 3][..]));
    drop(state);

    // The write produced an index dirty entry for the exact key.
    let dirty = index_repo::dirty_count(h.fs.db(), None).await.unwrap();
    assert_eq!(dirty, 1);
}

#[tokio::test]
async fn signature_expiry_triggers_silent_resign() {
    let h = harness(vec![2]).await;
    let viewer = admin();
    let size = 10 * MIB;

    let init = h
        .engine
        .init_multipart(&viewer, "/s3/retry.bin", size, "application/octet-stream", None, None)
        .await
        .unwrap();

    for part in 1..=2u32 {
        let chunk = h
            .engine
            .upload_chunk(&viewer, &init.file_id, part, Bytes::from(vec![1u8; (5 * MIB) as usize]))
            .await
            .unwrap();
        assert!(chunk.etag.is_some());
    }

    // Part 2's first PUT was rejected with 403 "expired"; the engine
    // re-signed and retried without surfacing an error.
    let state = h.mock.inner.lock().unwrap();
    assert_eq!(state.put_attempts.get(&2), Some(&2));
    assert_eq!(state.put_attempts.get(&1), Some(&1));
}

#[tokio::test]
async fn complete_requires_contiguous_parts_with_etags() {
    let h = harness(Vec::new()).await;
    let viewer = admin();

    let init = h
        .engine
        .init_multipart(&viewer, "/s3/gap.bin", 15 * MIB, "application/octet-stream", None, None)
        .await
        .unwrap();
    assert_eq!(init.total_parts, 3);

    // Only parts 1 and 3 uploaded.
    for part in [1u32, 3] {
        h.engine
            .upload_chunk(&viewer, &init.file_id, part, Bytes::from(vec![1u8; (5 * MIB) as usize]))
            .await
            .unwrap();
    }

    let err = h
        .engine
        .complete(&viewer, &init.file_id, &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("parts"), "unexpected error: {err}");
    // Failed completion leaves the session in place for a retry.
    assert!(h.engine.sessions.contains(&init.file_id));
}

#[tokio::test]
async fn server_can_list_resume_reads_backend_parts() {
    let h = harness(Vec::new()).await;
    let viewer = admin();

    let init = h
        .engine
        .init_multipart(&viewer, "/s3/resume.bin", 10 * MIB, "application/octet-stream", None, None)
        .await
        .unwrap();
    h.engine
        .upload_chunk(&viewer, &init.file_id, 1, Bytes::from(vec![1u8; (5 * MIB) as usize]))
        .await
        .unwrap();

    let listed = h.engine.list_parts(&viewer, &init.file_id).await.unwrap();
    assert_eq!(listed.policy, PartsLedgerPolicy::ServerCanList);
    assert_eq!(listed.parts.len(), 1);
    assert_eq!(listed.parts[0].part_number, 1);
    assert_eq!(listed.parts[0].etag.as_deref(), Some("\"e1\""));
}

#[tokio::test]
async fn abort_is_idempotent_and_clears_the_session() {
    let h = harness(Vec::new()).await;
    let viewer = admin();

    let init = h
        .engine
        .init_multipart(&viewer, "/s3/gone.bin", 6 * MIB, "application/octet-stream", None, None)
        .await
        .unwrap();

    h.engine.abort(&viewer, &init.file_id).await;
    assert!(!h.engine.sessions.contains(&init.file_id));
    // Aborting again is a no-op, never an error.
    h.engine.abort(&viewer, &init.file_id).await;
}

#[tokio::test]
async fn commit_presigned_is_idempotent_per_target_and_digest() {
    let h = harness(Vec::new()).await;
    let viewer = admin();

    // Put the object "directly" so commit's existence check passes.
    h.mock
        .inner
        .lock()
        .unwrap()
        .objects
        .insert("direct.bin".to_string(), 4);

    let first = h
        .engine
        .commit_presigned(&viewer, "/s3/direct.bin", Some("\"obj\""), None, None, 4)
        .await
        .unwrap();
    let second = h
        .engine
        .commit_presigned(&viewer, "/s3/direct.bin", Some("\"obj\""), None, None, 4)
        .await
        .unwrap();
    assert_eq!(first.etag, second.etag);

    // Only the first commit registered a write.
    let dirty = index_repo::dirty_count(h.fs.db(), None).await.unwrap();
    assert_eq!(dirty, 1);
}

#[tokio::test]
async fn api_keys_cannot_touch_foreign_sessions() {
    let h = harness(Vec::new()).await;
    let init = h
        .engine
        .init_multipart(&admin(), "/s3/owned.bin", 6 * MIB, "application/octet-stream", None, None)
        .await
        .unwrap();

    let other = Viewer::ApiKey(portico_vfs::ApiKeyIdentity {
        id: "k2".to_string(),
        name: "other".to_string(),
        permissions: permissions::MOUNT_UPLOAD | permissions::MOUNT_VIEW,
        basic_path: "/".to_string(),
        is_guest: false,
        storage_acl: Vec::new(),
    });
    let err = h
        .engine
        .upload_chunk(&other, &init.file_id, 1, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not your upload session"));
}

#[derive(Clone, Default)]
struct MockGraph {
    content_ranges: Arc<Mutex<Vec<String>>>,
}

#[tokio::test]
async fn single_session_uploads_use_content_range_math() {
    let mock = MockGraph::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upload_url = format!("http://{addr}/upload/session1");

    let session_url = upload_url.clone();
    let app = Router::new()
        .route(
            "/drive/root:/big.bin:/createUploadSession",
            axum::routing::post(move || {
                let session_url = session_url.clone();
                async move {
                    axum::Json(serde_json::json!({
                        "uploadUrl": session_url,
                        "nextExpectedRanges": ["0-"],
                    }))
                }
            }),
        )
        .route(
            "/upload/session1",
            axum::routing::put(
                |State(mock): State<MockGraph>, req: Request<Body>| async move {
                    let range = req
                        .headers()
                        .get(header::CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let _ = axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024).await;
                    mock.content_ranges.lock().unwrap().push(range);
                    StatusCode::ACCEPTED
                },
            ),
        )
        .route(
            "/drive/root:/big.bin",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({
                    "name": "big.bin",
                    "size": 7_340_032u64,
                    "eTag": "\"assembled\"",
                }))
            }),
        )
        .with_state(mock.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let tmp = tempfile::TempDir::new().unwrap();
    let pool = db::init_in_memory().await.unwrap();
    let config = storage_configs_repo::create(
        &pool,
        "od",
        "onedrive",
        None,
        serde_json::json!({
            "base_url": format!("http://{addr}/drive"),
            "access_token": "tok",
        }),
        String::new(),
        "",
        false,
        None,
    )
    .await
    .unwrap();
    mounts_repo::create(
        &pool,
        NewMount {
            name: "od".to_string(),
            mount_path: "/od".to_string(),
            storage_config_id: config.id,
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Redirect302,
            enable_sign: false,
            sign_expires_sec: None,
        },
    )
    .await
    .unwrap();
    let fs = Arc::new(FsService::new(
        pool.clone(),
        Arc::new(portico_driver_registry::DriverRegistry::new()),
        Arc::new(SecretsCrypto::load_or_create(tmp.path()).unwrap()),
        Arc::new(DirectoryCache::new()),
        Arc::new(PathTokenSigner::new(b"t".to_vec())),
        Arc::new(UrlSigner::new(b"s".to_vec())),
    ));
    let engine = UploadEngine::new(
        pool,
        fs,
        Arc::new(SessionManager::new(Duration::from_secs(3600))),
    );

    let viewer = admin();
    // 7 MiB file, 5 MiB parts: ranges 0-5242879 and 5242880-7340031.
    let init = engine
        .init_multipart(&viewer, "/od/big.bin", 7 * MIB, "application/octet-stream", None, None)
        .await
        .unwrap();
    assert_eq!(init.strategy, MultipartStrategy::SingleSession);
    assert_eq!(init.policy.parts_ledger_policy, PartsLedgerPolicy::ServerRecords);
    assert_eq!(init.total_parts, 2);

    engine
        .upload_chunk(&viewer, &init.file_id, 1, Bytes::from(vec![0u8; (5 * MIB) as usize]))
        .await
        .unwrap();
    engine
        .upload_chunk(&viewer, &init.file_id, 2, Bytes::from(vec![0u8; (2 * MIB) as usize]))
        .await
        .unwrap();

    let ranges = mock.content_ranges.lock().unwrap().clone();
    assert_eq!(
        ranges,
        ["bytes 0-5242879/7340032", "bytes 5242880-7340031/7340032"]
    );

    // Completion verifies the assembled item and drops the session.
    let done = engine.complete(&viewer, &init.file_id, &[]).await.unwrap();
    assert_eq!(done.etag.as_deref(), Some("\"assembled\""));
    assert!(!engine.sessions.contains(&init.file_id));
}

#[test]
fn strategy_selection_falls_back_in_order() {
    let caps = |multipart: bool, presigned: bool, stream: bool, form: bool| {
        portico_driver_api::Capabilities {
            storage_type: "test",
            remote: true,
            fs: portico_driver_api::FsCapabilities {
                multipart,
                presigned_single: presigned,
                backend_stream: stream,
                backend_form: form,
                ..Default::default()
            },
            share: Default::default(),
            multipart: None,
            sha256_required_for_presign: false,
        }
    };

    // Full-featured driver picks multipart by default.
    assert_eq!(
        select_strategy(&caps(true, true, true, true), None).unwrap(),
        Strategy::Multipart
    );
    // Requested mode is honored when supported.
    assert_eq!(
        select_strategy(&caps(true, true, true, true), Some("stream")).unwrap(),
        Strategy::BackendStream
    );
    // Unsupported request falls down the chain.
    assert_eq!(
        select_strategy(&caps(false, false, true, true), Some("multipart")).unwrap(),
        Strategy::BackendStream
    );
    assert_eq!(
        select_strategy(&caps(false, false, false, true), None).unwrap(),
        Strategy::BackendForm
    );
    // Nothing below the requested mode: unsupported.
    assert!(select_strategy(&caps(true, false, false, false), Some("stream")).is_err());
    assert!(select_strategy(&caps(false, false, false, false), None).is_err());
}
