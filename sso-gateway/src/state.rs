//! Shared application state for the gateway.
//!
//! Everything here is built once at startup and injected into the router.
//! Apart from the session store, none of it changes afterwards, so every
//! connection reads it concurrently without locking.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HOST, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::IdentityProvider;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::proxy::HttpProxy;
use crate::registry::AppRegistry;
use crate::session::{AuthState, CookieSigner, SessionGate, SessionStore};

/// Timeouts and addressing used by the proxy paths.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Bound on opening the backend WebSocket.
    pub ws_connect_timeout: Duration,
    /// Overrides the request `Host` header when rewriting backend URLs.
    pub public_authority: Option<String>,
    /// Base URL used to build the login callback, e.g. `https://sso.example.com`.
    pub public_url: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            ws_connect_timeout: Duration::from_secs(10),
            public_authority: None,
            public_url: None,
        }
    }
}

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AppRegistry>,
    pub gate: SessionGate,
    pub http: HttpProxy,
    pub provider: Arc<dyn IdentityProvider>,
    pub settings: ProxySettings,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        registry: AppRegistry,
        gate: SessionGate,
        http: HttpProxy,
        provider: Arc<dyn IdentityProvider>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            gate,
            http,
            provider,
            settings,
            metrics: None,
        }
    }

    /// Wires the state from resolved configuration.
    pub fn from_config(
        config: GatewayConfig,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self, GatewayError> {
        let gate = SessionGate::new(
            store,
            CookieSigner::new(config.secret_key.as_bytes()),
            Arc::new(config.policy),
            config.session_ttl,
        );
        let http = HttpProxy::new(Some(config.upstream_timeout))?;
        let settings = ProxySettings {
            ws_connect_timeout: config.ws_connect_timeout,
            public_authority: config.public_authority,
            public_url: config.public_url,
        };
        Ok(Self::new(config.registry, gate, http, provider, settings))
    }

    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Externally visible `host:port` of the gateway for this request.
    pub fn gateway_authority(&self, parts_host: Option<&str>) -> String {
        self.settings
            .public_authority
            .clone()
            .or_else(|| parts_host.map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Checks a browser `Origin` against the gateway's own origin.
    ///
    /// Session cookies ride along on cross-site WebSocket handshakes, so an
    /// upgrade from any other origin is refused.
    pub fn is_origin_allowed(&self, origin: &str, parts_host: Option<&str>) -> bool {
        let origin = origin.trim_end_matches('/');
        if let Some(public_url) = &self.settings.public_url {
            if public_url.trim_end_matches('/').eq_ignore_ascii_case(origin) {
                return true;
            }
        }
        origin
            .strip_prefix("http://")
            .or_else(|| origin.strip_prefix("https://"))
            .is_some_and(|authority| {
                authority.eq_ignore_ascii_case(&self.gateway_authority(parts_host))
            })
    }

    /// Base URL for links handed to the identity provider.
    pub fn public_base_url(&self, parts_host: Option<&str>) -> String {
        self.settings.public_url.as_ref().map_or_else(
            || format!("http://{}", self.gateway_authority(parts_host)),
            |url| url.trim_end_matches('/').to_string(),
        )
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthState {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        Ok(state.gate.current_principal(&jar))
    }
}

/// The request's `Host` header, if present and valid.
pub fn request_host(parts_headers: &axum::http::HeaderMap) -> Option<&str> {
    parts_headers.get(HOST).and_then(|v| v.to_str().ok())
}
