use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get, post, put};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use portico_config::Config;
use portico_engine::index::IndexService;
use portico_engine::{JobRegistry, ScheduledRunner, UploadEngine};
use portico_vfs::link::UrlSigner;
use portico_vfs::search::SearchService;
use portico_vfs::FsService;

mod admin;
mod auth;
mod backup;
mod error;
mod fs;
mod fs_meta;
mod index_admin;
mod jobs;
mod mounts;
mod proxy;
mod response;
mod scheduled;
mod share;
mod storage;
mod webdav;

#[cfg(test)]
mod tests;

pub(crate) use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub fs: Arc<FsService>,
    pub search: Arc<SearchService>,
    pub upload: Arc<UploadEngine>,
    pub jobs: Arc<JobRegistry>,
    pub index: Arc<IndexService>,
    pub scheduler: Arc<ScheduledRunner>,
    /// Signs short-lived url-proxy tickets (distinct key from path signing).
    pub tickets: Arc<UrlSigner>,
}

#[derive(Debug, Serialize)]
struct HealthData {
    ok: bool,
}

async fn health() -> axum::response::Response {
    response::ok(HealthData { ok: true })
}

#[derive(Debug, Serialize)]
struct VersionData {
    version: &'static str,
}

async fn version() -> axum::response::Response {
    response::ok(VersionData {
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: AppState) -> Router {
    let request_id_header = axum::http::HeaderName::from_static("x-request-id");
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|v| v.header_value().to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "http.request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        });

    Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .route("/api/public/guest-config", get(admin::guest_config))
        // Admin auth + keys + settings
        .route("/api/admin/login", post(admin::login))
        .route("/api/admin/logout", post(admin::logout))
        .route("/api/admin/change-password", post(admin::change_password))
        .route(
            "/api/admin/api-keys",
            get(admin::list_api_keys).post(admin::create_api_key),
        )
        .route(
            "/api/admin/api-keys/{id}",
            get(admin::get_api_key)
                .put(admin::update_api_key)
                .delete(admin::delete_api_key),
        )
        .route(
            "/api/admin/api-keys/{id}/storage-acl",
            put(admin::set_api_key_storage_acl),
        )
        .route("/api/admin/settings", get(admin::list_settings))
        .route("/api/admin/settings/metadata", get(admin::settings_metadata))
        .route("/api/admin/settings/groups", get(admin::settings_groups))
        .route(
            "/api/admin/settings/group/{gid}",
            get(admin::settings_group).put(admin::update_settings_group),
        )
        .route("/api/admin/dashboard/stats", get(admin::dashboard_stats))
        .route("/api/admin/cache/stats", get(admin::cache_stats))
        .route("/api/admin/cache/clear", post(admin::cache_clear))
        // Index admin
        .route("/api/admin/fs/index/status", get(index_admin::status))
        .route("/api/admin/fs/index/rebuild", post(index_admin::rebuild))
        .route("/api/admin/fs/index/stop", post(index_admin::stop))
        .route("/api/admin/fs/index/clear", post(index_admin::clear))
        .route(
            "/api/admin/fs/index/apply-dirty",
            post(index_admin::apply_dirty),
        )
        // Backup
        .route("/api/admin/backup/modules", get(backup::modules))
        .route("/api/admin/backup/create", post(backup::create))
        .route("/api/admin/backup/restore", post(backup::restore))
        .route(
            "/api/admin/backup/restore/preview",
            post(backup::restore_preview),
        )
        // Scheduled tasks
        .route("/api/admin/scheduled/types", get(scheduled::types))
        .route(
            "/api/admin/scheduled/jobs",
            get(scheduled::list).post(scheduled::create),
        )
        .route(
            "/api/admin/scheduled/jobs/{id}",
            get(scheduled::get_one)
                .put(scheduled::update)
                .delete(scheduled::delete),
        )
        .route("/api/admin/scheduled/jobs/{id}/runs", get(scheduled::runs))
        .route("/api/admin/scheduled/jobs/{id}/run", post(scheduled::run_now))
        .route("/api/admin/scheduled/ticker", get(scheduled::ticker))
        // Storage configs & types, mounts
        .route(
            "/api/storage",
            get(storage::list).post(storage::create),
        )
        .route(
            "/api/storage/{id}",
            get(storage::get_one)
                .put(storage::update)
                .delete(storage::delete),
        )
        .route("/api/storage/{id}/test", post(storage::test))
        .route("/api/storage/{id}/set-default", post(storage::set_default))
        .route("/api/storage-types", get(storage::types))
        .route(
            "/api/storage-types/{storage_type}/capabilities",
            get(storage::type_capabilities),
        )
        .route("/api/mount-schema", get(mounts::schema))
        .route("/api/mount/list", get(mounts::list))
        .route("/api/mount/create", post(mounts::create))
        .route(
            "/api/mount/{id}",
            get(mounts::get_one).put(mounts::update).delete(mounts::delete),
        )
        // Shares
        .route("/api/share/presign", post(share::presign))
        .route("/api/share/commit", post(share::commit))
        .route("/api/share/upload", post(share::upload))
        .route("/api/share/get/{slug}", get(share::get_share))
        .route("/api/share/verify/{slug}", post(share::verify))
        .route("/api/share/content/{slug}", get(share::content))
        .route("/api/share/url/info", get(share::url_info))
        .route("/api/share/url/proxy", get(share::url_proxy))
        .route("/api/share/url/proxy-ticket", post(share::url_proxy_ticket))
        .route("/api/s/{slug}", get(share::stream))
        .route("/api/files", get(share::list_files))
        .route(
            "/api/files/{slug}",
            get(share::get_file).delete(share::delete_file),
        )
        .route("/api/files/batch-delete", post(share::batch_delete_files))
        .route(
            "/api/upload-direct/{filename}",
            put(share::upload_direct).post(share::upload_direct),
        )
        .route("/api/upload/progress", get(fs::multipart_list_uploads))
        // Virtual filesystem
        .route("/api/fs/list", get(fs::list))
        .route("/api/fs/get", get(fs::get_entry))
        .route("/api/fs/download", get(fs::download))
        .route("/api/fs/content", get(fs::content))
        .route("/api/fs/file-link", get(fs::file_link))
        .route("/api/fs/create-share", post(fs::create_share))
        .route("/api/fs/mkdir", post(fs::mkdir))
        .route("/api/fs/upload", put(fs::upload).post(fs::upload))
        .route("/api/fs/update", post(fs::update))
        .route("/api/fs/rename", post(fs::rename))
        .route("/api/fs/batch-remove", post(fs::batch_remove))
        .route("/api/fs/batch-copy", post(fs::batch_copy))
        .route("/api/fs/search", get(fs::search))
        .route("/api/fs/presign", post(fs::presign))
        .route("/api/fs/presign/commit", post(fs::presign_commit))
        .route("/api/fs/multipart/init", post(fs::multipart_init))
        .route("/api/fs/multipart/upload-chunk", post(fs::multipart_upload_chunk))
        .route("/api/fs/multipart/complete", post(fs::multipart_complete))
        .route("/api/fs/multipart/abort", post(fs::multipart_abort))
        .route("/api/fs/multipart/list-uploads", get(fs::multipart_list_uploads))
        .route("/api/fs/multipart/list-parts", get(fs::multipart_list_parts))
        .route("/api/fs/multipart/refresh-urls", post(fs::multipart_refresh_urls))
        // Jobs
        .route("/api/fs/jobs", get(jobs::list))
        .route(
            "/api/fs/jobs/{job_id}",
            get(jobs::get_one).delete(jobs::delete),
        )
        .route("/api/fs/jobs/{job_id}/cancel", post(jobs::cancel))
        .route("/api/fs/jobs/{job_id}/retry", post(jobs::retry))
        // Directory metadata
        .route(
            "/api/fs-meta",
            get(fs_meta::get_meta)
                .put(fs_meta::put_meta)
                .delete(fs_meta::delete_meta),
        )
        .route("/api/fs/meta/password/verify", post(fs_meta::verify_password))
        // Reverse proxy + link resolver
        .route("/api/p/{*path}", get(proxy::serve))
        .route("/api/proxy/link", post(proxy::link))
        // WebDAV
        .route("/dav", any(webdav::handle_root))
        .route("/dav/", any(webdav::handle_root))
        .route("/dav/{*path}", any(webdav::handle))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::attach_viewer,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
