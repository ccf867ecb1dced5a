//! WebSocket upgrade handling for proxied apps.
//!
//! Reachable as `GET /ws/{app}` and `GET /app/{app}/ws`:
//! - A browser `Origin` other than the gateway's own is refused with 403
//!   before the upgrade
//! - The session gate runs next; unauthenticated sockets are closed with 4401
//!   right after the upgrade
//! - Unknown apps are closed with 4404
//! - A backend that cannot be reached is closed with 1011
//! - Otherwise the socket is relayed to the backend until either side leaves

use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::proxy;
use crate::session::AuthState;
use crate::state::{request_host, AppState};

/// WebSocket upgrade handler for `GET /ws/{app}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    auth: AuthState,
    Path(app_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, state, auth, app_name, &headers)
}

/// Completes the upgrade and hands the socket to [`handle_socket`].
///
/// A foreign `Origin` fails the handshake with 403. Requests without one come
/// from non-browser clients and go on to the session gate. Every later
/// rejection is delivered as a close frame on the upgraded socket so browsers
/// see a distinct close code.
pub fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    auth: AuthState,
    app_name: String,
    headers: &HeaderMap,
) -> Response {
    if let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state.is_origin_allowed(origin, request_host(headers)) {
            warn!(origin = origin, app = %app_name, "WebSocket rejected: disallowed origin");
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, auth, app_name))
}

/// Handles an upgraded connection from gate check to relay teardown.
async fn handle_socket(socket: WebSocket, state: AppState, auth: AuthState, app_name: String) {
    let AuthState::Authenticated(principal) = auth else {
        warn!(app = %app_name, "WebSocket rejected: not logged in");
        close_with(socket, &GatewayError::Unauthorized).await;
        return;
    };

    let Some(backend) = state.registry.resolve(&app_name).cloned() else {
        warn!(app = %app_name, user = %principal.email(), "WebSocket rejected: unknown app");
        close_with(socket, &GatewayError::AppNotFound(app_name)).await;
        return;
    };

    let backend_ws =
        match proxy::connect_backend(&backend, state.settings.ws_connect_timeout).await {
            Ok(backend_ws) => backend_ws,
            Err(e) => {
                warn!(app = %app_name, error = %e, "backend websocket connection failed");
                metrics::counter!("gateway_upstream_failures_total", "kind" => "ws").increment(1);
                close_with(socket, &e).await;
                return;
            }
        };

    info!(
        app = %app_name,
        user = %principal.email(),
        backend = %backend,
        "relay established"
    );
    metrics::counter!("gateway_relay_sessions_total", "app" => app_name.clone()).increment(1);

    let end = proxy::relay(socket, backend_ws).await;

    info!(app = %app_name, user = %principal.email(), reason = %end, "relay finished");
}

/// Sends a close frame carrying the error's close code and drops the socket.
async fn close_with(mut socket: WebSocket, err: &GatewayError) {
    let frame = CloseFrame {
        code: err.close_code(),
        reason: Cow::Borrowed(err.close_reason()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
