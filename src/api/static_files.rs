//! Read-only static file serving for the dashboard.
//!
//! Strictly GET/HEAD, strictly whitelisted: the `company`, `workspace`,
//! and `workspaces` trees plus a handful of root-level dashboard files.
//! Everything else — traversal sequences, null bytes, absolute paths,
//! symlinks escaping the state root — is rejected before touching disk.

use super::ApiState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Directory trees exposed to the dashboard.
const ALLOWED_TREES: &[&str] = &["company", "workspace", "workspaces"];

/// Root-level files the dashboard loads directly.
const ALLOWED_ROOT_FILES: &[&str] = &["workstream.html", "reset-ts.js", "company-state.json"];

/// Fallback handler for everything the router does not own.
pub async fn serve(State(state): State<Arc<ApiState>>, request: Request) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let requested = request.uri().path().trim_start_matches('/');
    let Some(path) = resolve_safe_path(&state.config.state_dir, requested) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let Ok(contents) = tokio::fs::read(&path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let content_type = content_type_for(&path);
    let body = if request.method() == Method::HEAD {
        Body::empty()
    } else {
        Body::from(contents)
    };

    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// Map a request path to a real file under the state root, or `None` when
/// the path is outside the whitelist or otherwise unsafe.
pub(crate) fn resolve_safe_path(state_root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() || requested.contains('\0') {
        return None;
    }

    let relative = Path::new(requested);
    if relative.is_absolute() {
        return None;
    }

    // Only plain path segments; `..`, drive prefixes, and roots all fail.
    let mut components = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => components.push(segment.to_str()?),
            _ => return None,
        }
    }

    let allowed = match components.as_slice() {
        [] => false,
        [file] => is_allowed_root_file(file),
        [tree, ..] => ALLOWED_TREES.contains(tree),
    };
    if !allowed {
        return None;
    }

    let path = state_root.join(relative);
    if !path.is_file() {
        return None;
    }

    // A symlink inside a whitelisted tree must not lead outside the root.
    let canonical = path.canonicalize().ok()?;
    let canonical_root = state_root.canonicalize().ok()?;
    if !canonical.starts_with(&canonical_root) {
        return None;
    }

    Some(canonical)
}

/// Directory variant used by `/_ls`: same whitelist and traversal rules,
/// but the target must be a directory.
pub(crate) fn resolve_safe_dir(state_root: &Path, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() || requested.contains('\0') {
        return None;
    }

    let relative = Path::new(requested);
    if relative.is_absolute() {
        return None;
    }

    let mut components = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => components.push(segment.to_str()?),
            _ => return None,
        }
    }

    match components.as_slice() {
        [] => return None,
        [tree, ..] => {
            if !ALLOWED_TREES.contains(tree) {
                return None;
            }
        }
    }

    let path = state_root.join(relative);
    if !path.is_dir() {
        return None;
    }

    let canonical = path.canonicalize().ok()?;
    let canonical_root = state_root.canonicalize().ok()?;
    if !canonical.starts_with(&canonical_root) {
        return None;
    }

    Some(canonical)
}

fn is_allowed_root_file(name: &str) -> bool {
    ALLOWED_ROOT_FILES.contains(&name) || name.ends_with("-data.js")
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") | Some("jsonl") => "application/json",
        Some("md") => "text/markdown; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
