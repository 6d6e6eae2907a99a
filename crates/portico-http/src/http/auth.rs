//! Authentication middleware and extractors.
//!
//! One middleware resolves the caller (admin token, API key via Bearer /
//! ApiKey / Basic / X-Custom-Auth-Key) into a [`Viewer`] request extension;
//! handlers pull it out with the extractors below. Signed URLs and tickets
//! are verified at their endpoints, not here.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;

use portico_storage::{admins_repo, api_keys_repo};
use portico_vfs::{ApiKeyIdentity, Viewer};

use super::{AppError, AppState};

fn key_to_identity(key: api_keys_repo::ApiKey) -> Viewer {
    Viewer::ApiKey(ApiKeyIdentity {
        id: key.id,
        name: key.name,
        permissions: key.permissions,
        basic_path: key.basic_path,
        is_guest: key.is_guest,
        storage_acl: key.storage_acl,
    })
}

async fn resolve_viewer(state: &AppState, headers: &HeaderMap) -> Option<Viewer> {
    if let Some(raw) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = raw.strip_prefix("Bearer ") {
            let token = token.trim();
            if let Ok(Some(admin)) = admins_repo::admin_for_token(&state.db, token).await {
                return Some(Viewer::Admin { admin_id: admin.id });
            }
            if let Ok(Some(key)) = api_keys_repo::validate(&state.db, token).await {
                return Some(key_to_identity(key));
            }
        } else if let Some(key) = raw.strip_prefix("ApiKey ") {
            if let Ok(Some(key)) = api_keys_repo::validate(&state.db, key.trim()).await {
                return Some(key_to_identity(key));
            }
        } else if let Some(encoded) = raw.strip_prefix("Basic ") {
            if let Some(viewer) = resolve_basic(state, encoded.trim()).await {
                return Some(viewer);
            }
        }
    }

    if let Some(key) = headers
        .get("x-custom-auth-key")
        .and_then(|v| v.to_str().ok())
        && let Ok(Some(key)) = api_keys_repo::validate(&state.db, key.trim()).await
    {
        return Some(key_to_identity(key));
    }

    None
}

/// Basic auth: WebDAV clients send `api_key:api_key`; admin
/// `username:password` also works so DAV mounts can run as admin.
async fn resolve_basic(state: &AppState, encoded: &str) -> Option<Viewer> {
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;

    if user == pass
        && let Ok(Some(key)) = api_keys_repo::validate(&state.db, user).await
    {
        return Some(key_to_identity(key));
    }
    if let Ok(Some(admin)) = admins_repo::authenticate(&state.db, user, pass).await {
        return Some(Viewer::Admin { admin_id: admin.id });
    }
    None
}

pub(super) async fn attach_viewer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(viewer) = resolve_viewer(&state, req.headers()).await {
        req.extensions_mut().insert(viewer);
    }
    next.run(req).await
}

/// Any authenticated caller.
pub(super) struct CurrentViewer(pub Viewer);

impl FromRequestParts<AppState> for CurrentViewer {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Viewer>()
            .cloned()
            .map(CurrentViewer)
            .ok_or_else(|| AppError::unauthorized("authentication required"))
    }
}

/// Admin-only endpoints.
pub(super) struct AdminViewer(pub Viewer);

impl FromRequestParts<AppState> for AdminViewer {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Viewer>() {
            Some(viewer @ Viewer::Admin { .. }) => Ok(AdminViewer(viewer.clone())),
            Some(_) => Err(AppError::forbidden("admin access required")),
            None => Err(AppError::unauthorized("authentication required")),
        }
    }
}

/// The raw bearer token, for logout.
pub(super) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}
