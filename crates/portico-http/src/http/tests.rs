//! End-to-end tests over a real listener, the way a client would drive the
//! gateway.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use portico_config::Config;
use portico_core::permissions;
use portico_engine::index::IndexService;
use portico_engine::upload::sessions::SessionManager;
use portico_engine::{JobRegistry, ScheduledRunner, UploadEngine};
use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
use portico_storage::{SecretsCrypto, admins_repo, api_keys_repo, db, storage_configs_repo};
use portico_vfs::FsService;
use portico_vfs::cache::DirectoryCache;
use portico_vfs::link::UrlSigner;
use portico_vfs::meta::PathTokenSigner;
use portico_vfs::search::SearchService;

use super::{AppState, router};

struct TestServer {
    base: String,
    client: reqwest::Client,
    admin_token: String,
    _tmp: tempfile::TempDir,
    state: AppState,
}

async fn spawn_server() -> TestServer {
    let tmp = tempfile::TempDir::new().unwrap();
    let pool = db::init_in_memory().await.unwrap();

    let config = storage_configs_repo::create(
        &pool,
        "mem",
        "memory",
        None,
        serde_json::json!({}),
        String::new(),
        "",
        false,
        None,
    )
    .await
    .unwrap();
    storage_configs_repo::set_default(&pool, &config.id).await.unwrap();
    mounts_repo::create(
        &pool,
        NewMount {
            name: "root".to_string(),
            mount_path: "/".to_string(),
            storage_config_id: config.id,
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Proxy,
            enable_sign: false,
            sign_expires_sec: None,
        },
    )
    .await
    .unwrap();

    let admin = admins_repo::create(&pool, "admin", "correct horse").await.unwrap();
    let (admin_token, _) = admins_repo::create_token(&pool, &admin.id).await.unwrap();

    let fs = Arc::new(FsService::new(
        pool.clone(),
        Arc::new(portico_driver_registry::DriverRegistry::new()),
        Arc::new(SecretsCrypto::load_or_create(tmp.path()).unwrap()),
        Arc::new(DirectoryCache::new()),
        Arc::new(PathTokenSigner::new(b"token-secret".to_vec())),
        Arc::new(UrlSigner::new(b"sign-secret".to_vec())),
    ));
    let jobs = Arc::new(JobRegistry::new(pool.clone(), CancellationToken::new()));
    let index = Arc::new(IndexService::new(pool.clone(), fs.clone()));
    jobs.register(Arc::new(portico_engine::index::RebuildHandler {
        service: index.clone(),
    }));
    jobs.register(Arc::new(portico_engine::index::ApplyDirtyHandler {
        service: index.clone(),
    }));
    jobs.register(Arc::new(portico_engine::copy::CopyHandler { fs: fs.clone() }));

    let sessions = Arc::new(SessionManager::new(Duration::from_secs(3600)));
    let upload = Arc::new(UploadEngine::new(pool.clone(), fs.clone(), sessions));
    let scheduler = Arc::new(ScheduledRunner::new(pool.clone()));

    let state = AppState {
        config: Arc::new(Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: tmp.path().to_path_buf(),
            admin_init_password: None,
            sign_secret: "sign-secret".to_string(),
            ticket_secret: "ticket-secret".to_string(),
            cache_ttl_default_secs: 300,
            upload_session_timeout_secs: 3600,
            debug_errors: false,
        }),
        db: pool,
        fs,
        search: Arc::new(SearchService::new()),
        upload,
        jobs,
        index,
        scheduler,
        tickets: Arc::new(UrlSigner::new(b"ticket-secret".to_vec())),
    };

    let app = router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap(),
        admin_token,
        _tmp: tmp,
        state,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn admin(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.admin_token)
    }

    async fn put_file(&self, path: &str, content: &str) {
        let res = self
            .admin(self.client.put(self.url(&format!("/api/fs/upload?path={path}"))))
            .header("content-type", "text/plain")
            .body(content.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 201, "upload of {path} failed");
    }
}

#[tokio::test]
async fn health_is_public_and_enveloped() {
    let server = spawn_server().await;
    let body: serde_json::Value = server
        .client
        .get(server.url("/api/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"]["ok"], true);
}

#[tokio::test]
async fn login_flow_issues_and_revokes_tokens() {
    let server = spawn_server().await;

    let res = server
        .client
        .post(server.url("/api/admin/login"))
        .json(&serde_json::json!({"username": "admin", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let body: serde_json::Value = server
        .client
        .post(server.url("/api/admin/login"))
        .json(&serde_json::json!({"username": "admin", "password": "correct horse"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = body["data"]["token"].as_str().unwrap().to_string();

    let res = server
        .client
        .post(server.url("/api/admin/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    // The token no longer works.
    let res = server
        .client
        .get(server.url("/api/admin/api-keys"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn basic_path_sandbox_denies_outside_paths() {
    let server = spawn_server().await;
    server.put_file("/public/docs/readme.txt", "hello").await;
    server.put_file("/private/secret.txt", "shh").await;

    // permissions = 768 = mount_view | mount_upload
    let (_, key) = api_keys_repo::create(
        &server.state.db,
        "scoped",
        permissions::MOUNT_VIEW | permissions::MOUNT_UPLOAD,
        "/public",
        false,
        None,
    )
    .await
    .unwrap();

    let res = server
        .client
        .get(server.url("/api/fs/list?path=/private"))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], 403);

    let res = server
        .client
        .get(server.url("/api/fs/list?path=/public/docs"))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    let names: Vec<&str> = body["data"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["name"].as_str())
        .collect();
    assert_eq!(names, ["readme.txt"]);
}

#[tokio::test]
async fn content_supports_ranges_and_never_redirects() {
    let server = spawn_server().await;
    server.put_file("/data/range.bin", "0123456789").await;

    let res = server
        .admin(server.client.get(server.url("/api/fs/content?path=/data/range.bin")))
        .header("range", "bytes=2-4")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 206);
    assert_eq!(
        res.headers().get("content-range").unwrap().to_str().unwrap(),
        "bytes 2-4/10"
    );
    assert_eq!(res.text().await.unwrap(), "234");
}

#[tokio::test]
async fn share_round_trip_with_password_and_views() {
    let server = spawn_server().await;
    server.put_file("/files/report.pdf", "pdf-bytes").await;

    let body: serde_json::Value = server
        .admin(server.client.post(server.url("/api/fs/create-share")))
        .json(&serde_json::json!({
            "path": "/files/report.pdf",
            "password": "pw",
            "maxViews": 2,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let slug = body["data"]["slug"].as_str().unwrap().to_string();

    // Unverified view hides the URLs.
    let body: serde_json::Value = server
        .client
        .get(server.url(&format!("/api/share/get/{slug}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["requiresPassword"], true);
    assert!(body["data"]["previewUrl"].is_null());
    assert_eq!(body["data"]["filename"], "report.pdf");

    // Wrong password fails; right password unlocks the same view.
    let res = server
        .client
        .post(server.url(&format!("/api/share/verify/{slug}")))
        .json(&serde_json::json!({"password": "nope"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let body: serde_json::Value = server
        .client
        .post(server.url(&format!("/api/share/verify/{slug}")))
        .json(&serde_json::json!({"password": "pw"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body["data"]["previewUrl"].as_str().unwrap(),
        format!("/api/s/{slug}")
    );

    // Streaming consumes the view budget atomically.
    for _ in 0..2 {
        let res = server
            .client
            .get(server.url(&format!("/api/s/{slug}?password=pw")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), "pdf-bytes");
    }
    let res = server
        .client
        .get(server.url(&format!("/api/s/{slug}?password=pw")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 410);
}

#[tokio::test]
async fn signed_proxy_paths_verify_signature_and_expiry() {
    let server = spawn_server().await;
    server.put_file("/media/clip.bin", "signed-content").await;

    let signed = server
        .state
        .fs
        .url_signer
        .signed_proxy_path("/media/clip.bin", 60);
    let res = server
        .client
        .get(server.url(&signed))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "signed-content");

    // Tampering with the path breaks the signature.
    let tampered = signed.replace("clip.bin", "other.bin");
    let res = server
        .client
        .get(server.url(&tampered))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn webdav_lock_gates_mutations_until_unlocked() {
    let server = spawn_server().await;
    server.put_file("/dav-docs/foo.txt", "locked content").await;

    // LOCK returns an opaque token.
    let res = server
        .admin(
            server
                .client
                .request(reqwest::Method::from_bytes(b"LOCK").unwrap(), server.url("/dav/dav-docs/foo.txt")),
        )
        .body(
            r#"<?xml version="1.0"?><D:lockinfo xmlns:D="DAV:"><D:lockscope><D:exclusive/></D:lockscope><D:locktype><D:write/></D:locktype></D:lockinfo>"#,
        )
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let token = res
        .headers()
        .get("lock-token")
        .unwrap()
        .to_str()
        .unwrap()
        .trim_matches(['<', '>'])
        .to_string();
    assert!(token.starts_with("opaquelocktoken:"));

    // DELETE without the token is refused with 423.
    let res = server
        .admin(server.client.delete(server.url("/dav/dav-docs/foo.txt")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 423);

    // With the token it succeeds, and UNLOCK removes the lock.
    let res = server
        .admin(server.client.delete(server.url("/dav/dav-docs/foo.txt")))
        .header("if", format!("(<{token}>)"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);

    let res = server
        .admin(
            server
                .client
                .request(reqwest::Method::from_bytes(b"UNLOCK").unwrap(), server.url("/dav/dav-docs/foo.txt")),
        )
        .header("lock-token", format!("<{token}>"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
}

#[tokio::test]
async fn webdav_propfind_lists_children_at_depth_one() {
    let server = spawn_server().await;
    server.put_file("/wd/a.txt", "a").await;
    server.put_file("/wd/sub/b.txt", "b").await;

    let res = server
        .admin(
            server
                .client
                .request(reqwest::Method::from_bytes(b"PROPFIND").unwrap(), server.url("/dav/wd")),
        )
        .header("depth", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 207);
    let xml = res.text().await.unwrap();

    let doc = roxmltree::Document::parse(&xml).unwrap();
    let hrefs: Vec<&str> = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "href")
        .filter_map(|n| n.text())
        .collect();
    assert!(hrefs.contains(&"/dav/wd/"));
    assert!(hrefs.contains(&"/dav/wd/a.txt"));
    assert!(hrefs.contains(&"/dav/wd/sub/"));
    assert!(!hrefs.iter().any(|h| h.contains("b.txt")));
}

#[tokio::test]
async fn webdav_put_and_get_round_trip() {
    let server = spawn_server().await;

    let res = server
        .admin(server.client.put(server.url("/dav/up/new.txt")))
        .header("content-length", "5")
        .body("fresh")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 201);

    let res = server
        .admin(server.client.get(server.url("/dav/up/new.txt")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "fresh");

    // Overwrite answers 204.
    let res = server
        .admin(server.client.put(server.url("/dav/up/new.txt")))
        .header("content-length", "6")
        .body("newer!")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
}

#[tokio::test]
async fn api_key_auth_via_basic_works_for_webdav() {
    let server = spawn_server().await;
    server.put_file("/bp/inside.txt", "x").await;

    let (_, secret) = api_keys_repo::create(
        &server.state.db,
        "dav",
        permissions::WEBDAV_READ | permissions::MOUNT_VIEW,
        "/bp",
        false,
        None,
    )
    .await
    .unwrap();

    // Basic with username == password == api key.
    let res = server
        .client
        .get(server.url("/dav/bp/inside.txt"))
        .basic_auth(&secret, Some(&secret))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    // Write methods need webdav_manage.
    let res = server
        .client
        .put(server.url("/dav/bp/write.txt"))
        .basic_auth(&secret, Some(&secret))
        .header("content-length", "1")
        .body("y")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 403);
}

#[tokio::test]
async fn search_endpoint_reports_index_gating() {
    let server = spawn_server().await;
    server.put_file("/idx/findme-report.txt", "x").await;

    // Index not built yet: global search succeeds with nothing searchable.
    let body: serde_json::Value = server
        .admin(server.client.get(server.url("/api/fs/search?q=findme&scope=global")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["indexReady"], false);

    // Rebuild through the admin endpoint, then the file is searchable.
    let body: serde_json::Value = server
        .admin(server.client.post(server.url("/api/admin/fs/index/rebuild")))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();

    for _ in 0..200 {
        let job = server.state.jobs.get(&job_id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Fresh query (search results are cached for 5 minutes per query).
    let body: serde_json::Value = server
        .admin(server.client.get(server.url("/api/fs/search?q=findme-rep&scope=global")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["indexReady"], true);
    assert_eq!(body["data"]["indexPartial"], false);
    let results = body["data"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["path"], "/idx/findme-report.txt");
}

#[tokio::test]
async fn guest_config_is_public() {
    let server = spawn_server().await;
    let body: serde_json::Value = server
        .client
        .get(server.url("/api/public/guest-config"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["siteName"], "Portico");
}
