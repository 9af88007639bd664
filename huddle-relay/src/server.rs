//! axum WebSocket front end.
//!
//! Each upgraded socket gets a writer task draining the connection's
//! outbound queue and a reader loop feeding decoded frames into a
//! [`Session`]. The first data frame fixes the wire format for the rest of
//! the connection: binary frames are postcard, text frames are JSON.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_proto::codec::{self, Frame, WireFormat};
use huddle_proto::event::ClientEvent;
use crate::lifecycle::{Flow, Session, SessionError};
use crate::registry::{OUTBOUND_QUEUE_CAPACITY, Outbound, OutboundReceiver, outbound_queue};
use crate::relay::RelayState;

/// How long the writer may keep flushing after the reader stopped.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type ServerHandle = (std::net::SocketAddr, tokio::task::JoinHandle<()>);

/// Handles an upgraded WebSocket connection.
///
/// 1. Wait for the first data frame; its type fixes the wire format.
/// 2. Spawn the writer task for that format.
/// 3. Feed every frame to the session until it asks to close, the client
///    goes away, or the writer fails.
/// 4. Close the session and let the writer flush what is left.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (ws_sender, mut ws_receiver) = socket.split();

    let Some(first) = next_frame(&mut ws_receiver).await else {
        tracing::debug!("connection closed before setup");
        return;
    };
    let format = first.format();

    let (tx, rx) = outbound_queue(OUTBOUND_QUEUE_CAPACITY);
    let mut write_task = tokio::spawn(write_loop(ws_sender, rx, format));
    let mut session = Session::new(Arc::clone(&state), tx);
    let max_payload_size = state.max_payload_size();

    let mut writer_done = false;
    tokio::select! {
        () = read_loop(&mut session, &mut ws_receiver, first, max_payload_size) => {}
        _ = &mut write_task => {
            writer_done = true;
            tracing::debug!("writer stopped");
        }
    }

    session.close().await;
    drop(session);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task).await.is_err() {
        tracing::warn!("writer did not drain in time");
        write_task.abort();
    }
}

async fn read_loop(
    session: &mut Session,
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    first: Frame,
    max_payload_size: usize,
) {
    let mut frame = first;
    loop {
        if handle_frame(session, &frame, max_payload_size).await == Flow::Close {
            return;
        }
        match next_frame(receiver).await {
            Some(next) => frame = next,
            None => {
                tracing::debug!(identity = ?session.identity(), "client went away");
                return;
            }
        }
    }
}

/// Decodes one frame and hands it to the session, reporting any rejection
/// back to the client.
async fn handle_frame(session: &mut Session, frame: &Frame, max_payload_size: usize) -> Flow {
    match dispatch(session, frame, max_payload_size).await {
        Ok(flow) => flow,
        Err(e) => {
            tracing::warn!(identity = ?session.identity(), error = %e, "client event rejected");
            session.report(&e);
            if e.is_fatal() { Flow::Close } else { Flow::Continue }
        }
    }
}

async fn dispatch(
    session: &mut Session,
    frame: &Frame,
    max_payload_size: usize,
) -> Result<Flow, SessionError> {
    if frame.len() > max_payload_size {
        return Err(SessionError::PayloadTooLarge {
            size: frame.len(),
            max: max_payload_size,
        });
    }
    let event: ClientEvent = match codec::decode(frame) {
        Ok(event) => event,
        // Nothing is bound yet, so a garbled frame is a malformed setup.
        Err(e) if session.identity().is_none() => {
            return Err(SessionError::AuthenticationMissing {
                reason: format!("malformed setup: {e}"),
            });
        }
        Err(e) => return Err(e.into()),
    };
    session.handle_event(event).await
}

/// Returns the next data frame, skipping ping/pong. `None` once the client
/// closes or the stream fails.
async fn next_frame(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<Frame> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => return Some(Frame::Binary(data.to_vec())),
            Ok(Message::Text(text)) => return Some(Frame::Text(text.as_str().to_owned())),
            Ok(Message::Close(_)) => return None,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket read failed");
                return None;
            }
        }
    }
    None
}

/// Encodes queued events in `format` and writes them to the socket.
///
/// Ends on [`Outbound::Close`] (including a queue overflow), when every
/// sender is gone, or on a write failure, sending a close frame where
/// possible.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    format: WireFormat,
) {
    while let Some(item) = rx.recv().await {
        let Outbound::Event(event) = item else {
            break;
        };
        let msg = match format.encode(event.as_ref()) {
            Ok(Frame::Binary(bytes)) => Message::Binary(bytes.into()),
            Ok(Frame::Text(text)) => Message::Text(text.into()),
            Err(e) => {
                tracing::error!(error = %e, %format, "failed to encode server event");
                continue;
            }
        };
        if ws_sender.send(msg).await.is_err() {
            tracing::debug!("WebSocket write failed");
            return;
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Starts the relay server on the given address with default state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with pre-built [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_shutdown(addr, state, std::future::pending()).await
}

/// Starts the relay server and shuts it down once `shutdown` resolves.
///
/// On shutdown the listener stops accepting and every open connection is
/// sent a close frame; the returned task ends once they have all closed.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_shutdown(
    addr: &str,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let signal = async move {
            shutdown.await;
            tracing::info!("shutting down, closing connections");
            state.close_all_connections().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing on an OS-assigned port.
#[cfg(test)]
pub async fn start_test_server(
    state: Arc<RelayState>,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start test server")
}

fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(health))
        .with_state(state)
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health() -> &'static str {
    "ok"
}
