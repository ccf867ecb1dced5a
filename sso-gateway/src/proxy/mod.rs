//! Upstream proxying: one-shot HTTP GETs and long-lived WebSocket relays.

pub mod http;
pub mod relay;

pub use http::{HttpProxy, ProxiedResponse};
pub use relay::{connect_backend, relay, RelayEnd};
