//! Single-sign-on gateway for backend web apps.
//!
//! Every request passes the session gate first, then the app name is
//! resolved against a static registry, and the request is either proxied as
//! a single HTTP GET or relayed as a WebSocket session.

pub mod auth;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod ws_handler;

pub use config::{Cli, GatewayConfig};
pub use error::{ConfigError, GatewayError};
pub use policy::AccessPolicy;
pub use registry::{AppRegistry, BackendAddr};
pub use router::build_router;
pub use session::{AuthState, MemorySessionStore, Principal, SessionGate, SessionStore};
pub use state::AppState;
