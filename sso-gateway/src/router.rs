//! Route table and the authenticated HTTP proxy handlers.

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use percent_encoding::percent_decode_str;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth;
use crate::error::GatewayError;
use crate::session::AuthState;
use crate::state::{request_host, AppState};
use crate::ws_handler;

/// Path unauthenticated browsers are sent to.
pub const LOGIN_PATH: &str = "/login";

/// Builds the gateway's full route table.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/logout", get(auth::logout))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/ws/:app_name", get(ws_handler::ws_handler))
        .route("/app/*rest", get(app_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Landing page listing the configured apps.
async fn index(State(state): State<AppState>, auth: AuthState) -> Response {
    let AuthState::Authenticated(principal) = auth else {
        return Redirect::to(LOGIN_PATH).into_response();
    };

    let items: String = state
        .registry
        .names()
        .into_iter()
        .map(|name| {
            let name = escape_html(name);
            format!("<li><a href=\"/app/{name}/\">{name}</a></li>")
        })
        .collect();

    Html(format!(
        "<!doctype html><html><head><title>Apps</title></head><body>\
         <p>Signed in as {} ({}) &middot; <a href=\"/logout\">Sign out</a></p>\
         <ul>{items}</ul></body></html>",
        escape_html(principal.name()),
        escape_html(principal.email()),
    ))
    .into_response()
}

/// A request under `/app/`, split into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct AppPath {
    /// Percent-decoded app name, as `/ws/:app_name` would extract it.
    pub app_name: String,
    /// Backend-relative path without a leading slash, query preserved.
    pub path: String,
    /// `true` for `/app/<name>` with no slash after the name.
    pub bare: bool,
}

/// Splits `/app/<name>/<rest>?<query>`. Returns `None` for an empty or
/// non-UTF-8 app name.
pub fn split_app_path(uri: &Uri) -> Option<AppPath> {
    let rest = uri.path().strip_prefix("/app/")?;
    let (raw_name, path, bare) = match rest.split_once('/') {
        Some((name, path)) => (name, path, false),
        None => (rest, "", true),
    };
    let app_name = percent_decode_str(raw_name).decode_utf8().ok()?;
    if app_name.is_empty() {
        return None;
    }
    let path = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    Some(AppPath {
        app_name: app_name.into_owned(),
        path,
        bare,
    })
}

/// `GET /app/{app}/{path...}`, including the `/app/{app}/ws` upgrade.
async fn app_handler(
    State(state): State<AppState>,
    auth: AuthState,
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(AppPath {
        app_name,
        path,
        bare,
    }) = split_app_path(&uri)
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let (Some(ws), "ws") = (ws, path.as_str()) {
        return ws_handler::upgrade(ws, state, auth, app_name, &headers);
    }

    let AuthState::Authenticated(principal) = auth else {
        return Redirect::to(LOGIN_PATH).into_response();
    };

    let Some(backend) = state.registry.resolve(&app_name) else {
        warn!(app = %app_name, user = %principal.email(), "request for unknown app");
        return GatewayError::AppNotFound(app_name).into_response();
    };

    // Relative asset links only resolve under the trailing-slash form.
    if bare {
        let location = match uri.query() {
            Some(q) => format!("{}/?{q}", uri.path()),
            None => format!("{}/", uri.path()),
        };
        return Redirect::permanent(&location).into_response();
    }

    let authority = state.gateway_authority(request_host(&headers));
    metrics::counter!("gateway_http_requests_total", "app" => app_name.clone()).increment(1);

    match state.http.forward(&app_name, backend, &path, &authority).await {
        Ok(upstream) => {
            let mut response = (upstream.status, upstream.body).into_response();
            match upstream
                .content_type
                .and_then(|ct| HeaderValue::from_str(&ct).ok())
            {
                Some(ct) => {
                    response.headers_mut().insert(CONTENT_TYPE, ct);
                }
                None => {
                    response.headers_mut().remove(CONTENT_TYPE);
                }
            }
            response
        }
        Err(e) => {
            metrics::counter!("gateway_upstream_failures_total", "kind" => "http").increment(1);
            e.into_response()
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
