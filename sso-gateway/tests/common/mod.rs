//! Shared fixtures: a fake backend app, a stub identity provider and a
//! gateway bound to an ephemeral loopback port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sso_gateway::auth::{IdentityProvider, UserInfo};
use sso_gateway::error::AuthError;
use sso_gateway::proxy::HttpProxy;
use sso_gateway::session::{CookieSigner, SessionData, SESSION_COOKIE};
use sso_gateway::state::ProxySettings;
use sso_gateway::{
    build_router, AccessPolicy, AppRegistry, AppState, BackendAddr, MemorySessionStore,
    Principal, SessionGate, SessionStore,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const SECRET: &[u8] = b"integration-test-secret";
pub const CSS: &[u8] = b"body { color: #c0ffee; }\n/* http://127.0.0.1:1/ stays */\n";

/// How the fake backend's WebSocket endpoint behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    /// Greets, then echoes every frame back with the same framing.
    Echo,
    /// Greets, then closes the connection.
    CloseAfterGreeting,
}

#[derive(Clone)]
struct BackendState {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    mode: WsMode,
    closed_tx: mpsc::UnboundedSender<()>,
}

/// A running fake backend app.
pub struct Backend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    /// Receives one message each time a backend WebSocket session ends.
    pub closed_rx: mpsc::UnboundedReceiver<()>,
}

impl Backend {
    pub async fn spawn(mode: WsMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let state = BackendState {
            addr,
            hits: hits.clone(),
            mode,
            closed_tx,
        };
        let app = Router::new()
            .route("/", get(backend_index))
            .route("/style.css", get(backend_css))
            .route("/legacy.html", get(backend_legacy_html))
            .route("/ws", get(backend_ws))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            hits,
            closed_rx,
        }
    }

    pub fn backend_addr(&self) -> BackendAddr {
        BackendAddr::new("127.0.0.1", self.addr.port())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn backend_index(State(state): State<BackendState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let origin = format!("127.0.0.1:{}", state.addr.port());
    let html = format!(
        "<!doctype html><html><head><title>term</title>\
         <link rel=\"stylesheet\" href=\"http://{origin}/style.css\"></head>\
         <body><div id=\"terminal\" data-url=\"ws://{origin}/ws\"></div></body></html>"
    );
    ([(CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

async fn backend_css(State(state): State<BackendState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ([(CONTENT_TYPE, "text/css")], CSS).into_response()
}

/// Latin-1 page, the exact bytes of which must reach the browser.
pub fn legacy_html(port: u16) -> Vec<u8> {
    let mut page =
        format!("<html><head><link href=\"http://127.0.0.1:{port}/a.css\"></head>").into_bytes();
    page.extend_from_slice(b"<body>caf\xe9</body></html>");
    page
}

async fn backend_legacy_html(State(state): State<BackendState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        [(CONTENT_TYPE, "text/html; charset=iso-8859-1")],
        legacy_html(state.addr.port()),
    )
        .into_response()
}

async fn backend_ws(ws: WebSocketUpgrade, State(state): State<BackendState>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| backend_session(socket, state))
}

async fn backend_session(mut socket: WebSocket, state: BackendState) {
    if socket
        .send(Message::Text("hello from backend".to_string()))
        .await
        .is_ok()
        && state.mode == WsMode::Echo
    {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                Message::Text(t) => Message::Text(t),
                Message::Binary(b) => Message::Binary(b),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    } else {
        let _ = socket.send(Message::Close(None)).await;
    }
    let _ = state.closed_tx.send(());
}

/// Identity provider accepting the code `good-code`.
pub struct StubProvider {
    pub identity: UserInfo,
}

#[async_trait]
impl IdentityProvider for StubProvider {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!("https://idp.test/authorize?redirect_uri={redirect_uri}&state={state}")
    }

    async fn exchange(&self, code: &str, _redirect_uri: &str) -> Result<UserInfo, AuthError> {
        if code == "good-code" {
            Ok(self.identity.clone())
        } else {
            Err(AuthError::Rejected("unknown code".to_string()))
        }
    }
}

/// Gateway state plus handles the tests poke at directly.
pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemorySessionStore>,
    pub signer: CookieSigner,
}

impl Harness {
    /// Registry `apps`, policy allowing only alice@example.com, and a
    /// provider that signs in as `login_as`.
    pub fn new(apps: Vec<(&str, BackendAddr)>, login_as: &str) -> Self {
        let store = Arc::new(MemorySessionStore::new());
        let signer = CookieSigner::new(SECRET);
        let gate = SessionGate::new(
            store.clone(),
            signer.clone(),
            Arc::new(AccessPolicy::from_config("alice@example.com", "")),
            chrono::Duration::hours(1),
        );
        let provider = StubProvider {
            identity: UserInfo {
                email: login_as.to_string(),
                name: Some("Test User".to_string()),
            },
        };
        let settings = ProxySettings {
            ws_connect_timeout: Duration::from_secs(2),
            ..ProxySettings::default()
        };
        let state = AppState::new(
            AppRegistry::from_entries(apps),
            gate,
            HttpProxy::new(Some(Duration::from_secs(5))).unwrap(),
            Arc::new(provider),
            settings,
        );
        Self {
            state,
            store,
            signer,
        }
    }

    /// Stores a session for `email` and returns a `Cookie` header value for it.
    pub fn session_cookie(&self, email: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let principal = Principal::new(email, None).unwrap();
        self.store
            .set(&id, SessionData::new(principal, chrono::Duration::hours(1)));
        format!("{SESSION_COOKIE}={}", self.signer.sign(&id))
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serves the gateway on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

/// HTTP client that does not follow redirects.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// An address nothing listens on.
pub async fn dead_backend() -> BackendAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    BackendAddr::new("127.0.0.1", port)
}
