//! WebSocket connection to the relay.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::codec::{self, Frame, WireFormat};
use huddle_proto::event::{ClientEvent, MessagePayload, ServerEvent};
use huddle_proto::identity::{ChannelKey, Identity};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSender = futures_util::stream::SplitSink<WsStream, Message>;
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Timeout for opening the WebSocket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the relay to answer `setup` with the online contacts.
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Contacts currently known to be online, shared with the reader task.
type OnlineSet = Arc<parking_lot::Mutex<BTreeSet<Identity>>>;

struct Established {
    sender: WsSender,
    reader: WsReader,
    online: Vec<Identity>,
    early: Vec<ServerEvent>,
}

/// A bound connection to the relay.
///
/// Created via [`RelayClient::connect`], which opens the WebSocket, sends
/// `setup` and waits for the online-contacts reply before returning.
pub struct RelayClient {
    url: String,
    identity: Identity,
    contacts: Vec<Identity>,
    format: WireFormat,
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    online: OnlineSet,
    channels: parking_lot::Mutex<BTreeSet<ChannelKey>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Connects using binary (postcard) frames.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if connecting or setup takes too long.
    /// - [`ClientError::WebSocket`] if the relay cannot be reached.
    /// - [`ClientError::Rejected`] if the relay refuses the identity.
    pub async fn connect(
        url: &str,
        identity: Identity,
        contacts: Vec<Identity>,
    ) -> Result<Self, ClientError> {
        Self::connect_with_format(url, identity, contacts, WireFormat::Binary).await
    }

    /// Connects using the given wire format.
    ///
    /// # Errors
    ///
    /// Same as [`RelayClient::connect`].
    pub async fn connect_with_format(
        url: &str,
        identity: Identity,
        contacts: Vec<Identity>,
        format: WireFormat,
    ) -> Result<Self, ClientError> {
        let established = establish(url, &identity, &contacts, format).await?;

        let online: OnlineSet = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_handle = spawn_reader(established.reader, established.online, established.early, tx, &online, &connected);

        tracing::info!(identity = %identity, url, %format, "connected to relay");

        Ok(Self {
            url: url.to_string(),
            identity,
            contacts,
            format,
            ws_sender: Mutex::new(established.sender),
            incoming: Mutex::new(rx),
            online,
            channels: parking_lot::Mutex::default(),
            connected,
            reader_handle,
        })
    }

    /// The identity this client is bound to.
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the WebSocket to the relay is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Contacts currently online, as last reported by the relay.
    pub fn online_contacts(&self) -> Vec<Identity> {
        self.online.lock().iter().cloned().collect()
    }

    /// Whether `contact` is currently online.
    pub fn is_online(&self, contact: &Identity) -> bool {
        self.online.lock().contains(contact)
    }

    /// Channels this client has joined and not left.
    pub fn joined_channels(&self) -> Vec<ChannelKey> {
        self.channels.lock().iter().cloned().collect()
    }

    /// Starts listening on `channel`.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] if the connection is down.
    pub async fn join_channel(&self, channel: ChannelKey) -> Result<(), ClientError> {
        self.send(&ClientEvent::JoinChannel {
            channel: channel.clone(),
        })
        .await?;
        self.channels.lock().insert(channel);
        Ok(())
    }

    /// Stops listening on `channel`.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] if the connection is down.
    pub async fn leave_channel(&self, channel: ChannelKey) -> Result<(), ClientError> {
        self.channels.lock().remove(&channel);
        self.send(&ClientEvent::LeaveChannel { channel }).await
    }

    /// Submits an already-persisted message to `channel`.
    ///
    /// To message a single user directly, submit to the channel named after
    /// their identity.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] if the connection is down.
    pub async fn submit(
        &self,
        channel: ChannelKey,
        payload: MessagePayload,
    ) -> Result<(), ClientError> {
        self.send(&ClientEvent::SubmitMessage { channel, payload })
            .await
    }

    /// Receives the next event pushed by the relay.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] once the connection is gone and
    /// every buffered event has been consumed.
    pub async fn recv(&self) -> Result<ServerEvent, ClientError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ClientError::ConnectionClosed)
    }

    /// Opens a fresh connection, repeats setup and re-joins every channel.
    ///
    /// The relay drops membership with the old connection, so joins are
    /// re-issued here. Events buffered from the old connection stay
    /// available to [`RelayClient::recv`].
    ///
    /// # Errors
    ///
    /// Same as [`RelayClient::connect`].
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        self.reader_handle.abort();
        let established = establish(&self.url, &self.identity, &self.contacts, self.format).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let old = std::mem::replace(self.incoming.get_mut(), rx);
        forward_leftovers(old, &tx);

        self.connected.store(true, Ordering::Relaxed);
        self.reader_handle = spawn_reader(
            established.reader,
            established.online,
            established.early,
            tx,
            &self.online,
            &self.connected,
        );
        *self.ws_sender.get_mut() = established.sender;

        let channels = self.joined_channels();
        for channel in &channels {
            self.send(&ClientEvent::JoinChannel {
                channel: channel.clone(),
            })
            .await?;
        }
        tracing::info!(identity = %self.identity, channels = channels.len(), "reconnected to relay");
        Ok(())
    }

    /// Says goodbye to the relay and closes the WebSocket.
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectionClosed`] if the connection was already down.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        self.send(&ClientEvent::Disconnect).await?;
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(error = %e, "close after disconnect failed");
        }
        drop(sender);
        self.connected.store(false, Ordering::Relaxed);
        tracing::info!(identity = %self.identity, "disconnected from relay");
        Ok(())
    }

    async fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }
        let msg = into_message(self.format.encode(event)?);

        let mut sender = self.ws_sender.lock().await;
        sender.send(msg).await.map_err(|e| {
            tracing::warn!(error = %e, "relay send failed");
            self.connected.store(false, Ordering::Relaxed);
            ClientError::ConnectionClosed
        })
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Opens the WebSocket, sends `setup` and waits for the online contacts.
///
/// Presence events or messages that arrive before the reply are returned in
/// `early` so the caller can replay them in order.
async fn establish(
    url: &str,
    identity: &Identity,
    contacts: &[Identity],
    format: WireFormat,
) -> Result<Established, ClientError> {
    let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "relay connect timed out");
            ClientError::Timeout
        })??;
    let (mut sender, mut reader) = ws_stream.split();

    let setup = ClientEvent::Setup {
        identity: identity.clone(),
        contacts: contacts.to_vec(),
    };
    sender.send(into_message(format.encode(&setup)?)).await?;

    let deadline = tokio::time::Instant::now() + SETUP_TIMEOUT;
    let mut early = Vec::new();
    loop {
        let next = tokio::time::timeout_at(deadline, reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "relay setup reply timed out");
                ClientError::Timeout
            })?;
        let frame = match next {
            Some(Ok(msg)) => match into_frame(msg) {
                Incoming::Frame(frame) => frame,
                Incoming::Skip => continue,
                Incoming::Closed => return Err(ClientError::ConnectionClosed),
            },
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::ConnectionClosed),
        };
        match codec::decode::<ServerEvent>(&frame)? {
            ServerEvent::OnlineContacts { identities } => {
                return Ok(Established {
                    sender,
                    reader,
                    online: identities,
                    early,
                });
            }
            ServerEvent::Error { reason } => {
                tracing::warn!(reason = %reason, "relay rejected setup");
                return Err(ClientError::Rejected { reason });
            }
            other => early.push(other),
        }
    }
}

fn spawn_reader(
    reader: WsReader,
    online_now: Vec<Identity>,
    early: Vec<ServerEvent>,
    tx: mpsc::UnboundedSender<ServerEvent>,
    online: &OnlineSet,
    connected: &Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    {
        let mut set = online.lock();
        set.clear();
        set.extend(online_now);
    }
    for event in early {
        apply_presence(online, &event);
        let _ = tx.send(event);
    }
    tokio::spawn(reader_loop(
        reader,
        tx,
        Arc::clone(online),
        Arc::clone(connected),
    ))
}

/// Reads relay frames, updates the presence view and queues every event.
///
/// Malformed frames are logged and skipped. Sets `connected` to `false`
/// when the WebSocket closes or fails.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::UnboundedSender<ServerEvent>,
    online: OnlineSet,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        let frame = match msg_result {
            Ok(msg) => match into_frame(msg) {
                Incoming::Frame(frame) => frame,
                Incoming::Skip => continue,
                Incoming::Closed => {
                    tracing::info!("relay closed the connection");
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "relay read error");
                break;
            }
        };
        match codec::decode::<ServerEvent>(&frame) {
            Ok(event) => {
                if let ServerEvent::Error { reason } = &event {
                    tracing::warn!(reason = %reason, "relay reported an error");
                }
                apply_presence(&online, &event);
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed relay frame, skipping"),
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("relay reader exiting");
}

fn apply_presence(online: &parking_lot::Mutex<BTreeSet<Identity>>, event: &ServerEvent) {
    match event {
        ServerEvent::ContactJoined { identity } => {
            online.lock().insert(identity.clone());
        }
        ServerEvent::ContactLeft { identity } => {
            online.lock().remove(identity);
        }
        ServerEvent::OnlineContacts { identities } => {
            let mut set = online.lock();
            set.clear();
            set.extend(identities.iter().cloned());
        }
        ServerEvent::MessageReceived { .. } | ServerEvent::Error { .. } => {}
    }
}

fn forward_leftovers(
    mut old: mpsc::UnboundedReceiver<ServerEvent>,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    while let Ok(event) = old.try_recv() {
        let _ = tx.send(event);
    }
}

enum Incoming {
    Frame(Frame),
    Skip,
    Closed,
}

fn into_frame(msg: Message) -> Incoming {
    match msg {
        Message::Binary(data) => Incoming::Frame(Frame::Binary(data.to_vec())),
        Message::Text(text) => Incoming::Frame(Frame::Text(text.as_str().to_owned())),
        Message::Close(_) => Incoming::Closed,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Incoming::Skip,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    }
}
