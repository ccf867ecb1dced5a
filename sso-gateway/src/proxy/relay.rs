//! Bidirectional WebSocket relay between a browser and a backend app.
//!
//! A relay moves through `Connecting -> Relaying -> Closing -> Closed`. The
//! two directions run concurrently; whichever finishes first (clean close,
//! error or disconnect) cancels the other, and both sockets are then closed.
//! There is no reconnect: the browser opens a fresh upgrade instead.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::registry::BackendAddr;

/// Upper bound on sending close frames during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a relay stopped. Informational only; none of these are errors for the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    BackendClosed,
    ClientError(String),
    BackendError(String),
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::BackendClosed => write!(f, "backend closed"),
            Self::ClientError(e) => write!(f, "client error: {e}"),
            Self::BackendError(e) => write!(f, "backend error: {e}"),
        }
    }
}

/// Opens the backend's WebSocket endpoint at `ws://<backend>/ws`.
///
/// No keepalive pings are sent towards the backend.
pub async fn connect_backend(
    backend: &BackendAddr,
    connect_timeout: Duration,
) -> Result<BackendSocket, GatewayError> {
    let url = backend.ws_url();
    debug!(url = %url, "connecting to backend websocket");

    let unavailable = |reason: String| GatewayError::UpstreamUnavailable {
        backend: backend.to_string(),
        reason,
    };

    match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(e)) => Err(unavailable(e.to_string())),
        Err(_) => Err(unavailable(format!(
            "connect timed out after {}s",
            connect_timeout.as_secs()
        ))),
    }
}

/// Pumps frames between `client` and `backend` until either side ends, then
/// closes both.
pub async fn relay(client: WebSocket, backend: BackendSocket) -> RelayEnd {
    let (client_tx, client_rx) = client.split();
    let (backend_tx, backend_rx) = backend.split();
    relay_split(client_tx, client_rx, backend_tx, backend_rx).await
}

async fn relay_split<CT, CR, BT, BR>(
    mut client_tx: CT,
    mut client_rx: CR,
    mut backend_tx: BT,
    mut backend_rx: BR,
) -> RelayEnd
where
    CT: Sink<ClientMessage> + Unpin,
    CR: Stream<Item = Result<ClientMessage, axum::Error>> + Unpin,
    BT: Sink<BackendMessage> + Unpin,
    BT::Error: fmt::Display,
    BR: Stream<Item = Result<BackendMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    CT::Error: fmt::Display,
{
    // The losing direction's future is dropped when select! returns, which
    // cancels its pending read before anything is closed.
    let end = tokio::select! {
        end = client_to_backend(&mut client_rx, &mut backend_tx) => end,
        end = backend_to_client(&mut backend_rx, &mut client_tx) => end,
    };
    debug!(reason = %end, "relay direction finished, closing both sides");

    if tokio::time::timeout(CLOSE_TIMEOUT, backend_tx.close()).await.is_err() {
        warn!("timed out closing backend websocket");
    }
    if tokio::time::timeout(CLOSE_TIMEOUT, client_tx.close()).await.is_err() {
        warn!("timed out closing client websocket");
    }

    info!(reason = %end, "relay closed");
    end
}

async fn client_to_backend<CR, BT>(client_rx: &mut CR, backend_tx: &mut BT) -> RelayEnd
where
    CR: Stream<Item = Result<ClientMessage, axum::Error>> + Unpin,
    BT: Sink<BackendMessage> + Unpin,
    BT::Error: fmt::Display,
{
    while let Some(msg) = client_rx.next().await {
        let forward = match msg {
            Ok(ClientMessage::Text(text)) => BackendMessage::Text(text),
            Ok(ClientMessage::Binary(data)) => BackendMessage::Binary(data),
            // Pings are answered by the server stack on each hop.
            Ok(ClientMessage::Ping(_) | ClientMessage::Pong(_)) => continue,
            Ok(ClientMessage::Close(_)) => return RelayEnd::ClientClosed,
            Err(e) => return RelayEnd::ClientError(e.to_string()),
        };
        if let Err(e) = backend_tx.send(forward).await {
            return RelayEnd::BackendError(e.to_string());
        }
    }
    RelayEnd::ClientClosed
}

async fn backend_to_client<BR, CT>(backend_rx: &mut BR, client_tx: &mut CT) -> RelayEnd
where
    BR: Stream<Item = Result<BackendMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    CT: Sink<ClientMessage> + Unpin,
    CT::Error: fmt::Display,
{
    while let Some(msg) = backend_rx.next().await {
        let forward = match msg {
            Ok(BackendMessage::Text(text)) => ClientMessage::Text(text),
            Ok(BackendMessage::Binary(data)) => ClientMessage::Binary(data),
            Ok(BackendMessage::Ping(_) | BackendMessage::Pong(_) | BackendMessage::Frame(_)) => {
                continue
            }
            Ok(BackendMessage::Close(_)) => return RelayEnd::BackendClosed,
            Err(e) => return RelayEnd::BackendError(e.to_string()),
        };
        if let Err(e) = client_tx.send(forward).await {
            return RelayEnd::ClientError(e.to_string());
        }
    }
    RelayEnd::BackendClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc;
    use futures_util::stream;

    type ClientItem = Result<ClientMessage, axum::Error>;
    type BackendItem = Result<BackendMessage, tokio_tungstenite::tungstenite::Error>;

    #[tokio::test]
    async fn test_framing_is_preserved_towards_client() {
        let (client_tx, mut client_seen) = mpsc::unbounded::<ClientMessage>();
        let (backend_tx, _backend_seen) = mpsc::unbounded::<BackendMessage>();
        let backend_rx = stream::iter(vec![
            Ok::<_, tokio_tungstenite::tungstenite::Error>(BackendMessage::Text("hello".into())),
            Ok(BackendMessage::Binary(vec![1, 2, 3])),
            Ok(BackendMessage::Close(None)),
        ]);
        // Client never sends anything.
        let client_rx = stream::pending::<ClientItem>();

        let end = relay_split(client_tx, client_rx, backend_tx, backend_rx).await;
        assert_eq!(end, RelayEnd::BackendClosed);

        assert!(matches!(client_seen.next().await, Some(ClientMessage::Text(t)) if t == "hello"));
        assert!(
            matches!(client_seen.next().await, Some(ClientMessage::Binary(b)) if b == vec![1, 2, 3])
        );
        // Sink was closed during teardown.
        assert!(client_seen.next().await.is_none());
    }

    #[tokio::test]
    async fn test_client_close_cancels_backend_direction() {
        let (client_tx, _client_seen) = mpsc::unbounded::<ClientMessage>();
        let (backend_tx, mut backend_seen) = mpsc::unbounded::<BackendMessage>();
        let client_rx = stream::iter(vec![
            Ok::<_, axum::Error>(ClientMessage::Text("ls\r".into())),
            Ok(ClientMessage::Binary(vec![9])),
            Ok(ClientMessage::Close(None)),
        ]);
        // Backend stays silent forever; the relay must still finish.
        let backend_rx = stream::pending::<BackendItem>();

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            relay_split(client_tx, client_rx, backend_tx, backend_rx),
        )
        .await
        .expect("relay did not terminate");
        assert_eq!(end, RelayEnd::ClientClosed);

        assert!(matches!(
            backend_seen.next().await,
            Some(BackendMessage::Text(t)) if t == "ls\r"
        ));
        assert!(matches!(
            backend_seen.next().await,
            Some(BackendMessage::Binary(b)) if b == vec![9]
        ));
        assert!(backend_seen.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_end_counts_as_disconnect() {
        let (client_tx, _client_seen) = mpsc::unbounded::<ClientMessage>();
        let (backend_tx, _backend_seen) = mpsc::unbounded::<BackendMessage>();
        let client_rx = stream::pending::<ClientItem>();
        let backend_rx = stream::empty::<BackendItem>();

        let end = relay_split(client_tx, client_rx, backend_tx, backend_rx).await;
        assert_eq!(end, RelayEnd::BackendClosed);
    }

    #[tokio::test]
    async fn test_connect_failure_is_upstream_unavailable() {
        // Bind then drop to get a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_backend(&BackendAddr::new("127.0.0.1", port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
        assert_eq!(err.close_code(), 1011);
    }
}
