// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! End-to-end presence and relay tests over real WebSockets.
//!
//! Each test starts an in-process relay on an OS-assigned port and drives it
//! with raw `tokio-tungstenite` clients. The departure grace is shortened so
//! the debounce can be observed in real time: a disconnect followed by a
//! reconnect well inside the window is never announced as a departure, while
//! a disconnect that outlasts it is announced exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use huddle_proto::codec;
use huddle_proto::event::{ClientEvent, MessagePayload, ServerEvent};
use huddle_proto::identity::{ChannelKey, Identity};
use huddle_relay::config::RelayConfig;
use huddle_relay::relay::RelayState;
use huddle_relay::server;
use tokio_tungstenite::tungstenite;

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Departure grace used by these tests.
const GRACE: Duration = Duration::from_millis(600);

/// How long to listen before concluding nothing else is coming.
const QUIET: Duration = Duration::from_millis(300);

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

fn key(s: &str) -> ChannelKey {
    ChannelKey::new(s).unwrap()
}

struct Relay {
    addr: std::net::SocketAddr,
    state: Arc<RelayState>,
    _handle: tokio::task::JoinHandle<()>,
}

async fn start_relay() -> Relay {
    let state = Arc::new(RelayState::with_config(&RelayConfig {
        departure_grace: GRACE,
        ..RelayConfig::default()
    }));
    let (addr, handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    Relay {
        addr,
        state,
        _handle: handle,
    }
}

struct Client {
    ws: Ws,
}

impl Client {
    /// Connects, sends setup and returns the client with the online contacts.
    async fn setup(relay: &Relay, identity: &str, contacts: &[&str]) -> (Self, Vec<Identity>) {
        let url = format!("ws://{}/ws", relay.addr);
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let mut client = Self { ws };
        client
            .send(&ClientEvent::Setup {
                identity: id(identity),
                contacts: contacts.iter().map(|c| id(c)).collect(),
            })
            .await;
        match client.recv().await {
            ServerEvent::OnlineContacts { identities } => (client, identities),
            other => panic!("expected OnlineContacts, got {other:?}"),
        }
    }

    async fn send(&mut self, event: &ClientEvent) {
        let bytes = codec::encode_binary(event).unwrap();
        self.ws
            .send(tungstenite::Message::Binary(bytes.into()))
            .await
            .unwrap();
    }

    async fn join(&mut self, channel: &str) {
        self.send(&ClientEvent::JoinChannel {
            channel: key(channel),
        })
        .await;
    }

    async fn submit(&mut self, channel: &str, text: &str) {
        self.send(&ClientEvent::SubmitMessage {
            channel: key(channel),
            payload: MessagePayload::text(text),
        })
        .await;
    }

    async fn recv(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("read failed");
            if let tungstenite::Message::Binary(data) = msg {
                return codec::decode_binary(&data).unwrap();
            }
        }
    }

    /// Asserts that nothing arrives for [`QUIET`].
    async fn expect_silence(&mut self) {
        if let Ok(Some(Ok(msg))) = tokio::time::timeout(QUIET, self.ws.next()).await {
            let event: ServerEvent = codec::decode_binary(&msg.into_data()).unwrap();
            panic!("expected silence, got {event:?}");
        }
    }

    /// Drops the socket without a goodbye, as a browser reload does.
    async fn vanish(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Lets the relay finish processing frames already sent.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn arrival_is_announced_to_online_friends() {
    let relay = start_relay().await;
    let (mut bob, online) = Client::setup(&relay, "bob", &["alice"]).await;
    assert!(online.is_empty());

    let (_alice, online) = Client::setup(&relay, "alice", &["bob", "carol"]).await;

    assert_eq!(online, vec![id("bob")]);
    assert_eq!(
        bob.recv().await,
        ServerEvent::ContactJoined {
            identity: id("alice")
        }
    );
}

#[tokio::test]
async fn second_tab_is_not_announced_again() {
    let relay = start_relay().await;
    let (mut bob, _) = Client::setup(&relay, "bob", &["alice"]).await;
    let (_tab1, _) = Client::setup(&relay, "alice", &["bob"]).await;
    assert!(matches!(bob.recv().await, ServerEvent::ContactJoined { .. }));

    let (_tab2, online) = Client::setup(&relay, "alice", &["bob"]).await;

    assert_eq!(online, vec![id("bob")]);
    bob.expect_silence().await;
}

#[tokio::test]
async fn reload_within_grace_is_not_a_departure() {
    let relay = start_relay().await;
    let (mut bob, _) = Client::setup(&relay, "bob", &["alice"]).await;
    let (alice, _) = Client::setup(&relay, "alice", &["bob"]).await;
    assert!(matches!(bob.recv().await, ServerEvent::ContactJoined { .. }));

    alice.vanish().await;
    tokio::time::sleep(GRACE / 3).await;
    let (_alice, _) = Client::setup(&relay, "alice", &["bob"]).await;

    // The reconnect is a fresh arrival; repeating it is harmless.
    assert_eq!(
        bob.recv().await,
        ServerEvent::ContactJoined {
            identity: id("alice")
        }
    );
    tokio::time::sleep(GRACE).await;
    bob.expect_silence().await;
    assert_eq!(relay.state.presence.pending_departures().await, 0);
}

#[tokio::test]
async fn contact_arriving_during_grace_sees_the_reconnect() {
    let relay = start_relay().await;
    let (alice, _) = Client::setup(&relay, "alice", &["carol"]).await;
    alice.vanish().await;
    settle().await;

    let (mut carol, online) = Client::setup(&relay, "carol", &["alice"]).await;
    assert!(online.is_empty());

    let (_alice, online) = Client::setup(&relay, "alice", &["carol"]).await;
    assert_eq!(online, vec![id("carol")]);
    assert_eq!(
        carol.recv().await,
        ServerEvent::ContactJoined {
            identity: id("alice")
        }
    );
    tokio::time::sleep(GRACE).await;
    carol.expect_silence().await;
}

#[tokio::test]
async fn departure_is_announced_once_after_grace() {
    let relay = start_relay().await;
    let (mut bob, _) = Client::setup(&relay, "bob", &["alice"]).await;
    let (alice, _) = Client::setup(&relay, "alice", &["bob"]).await;
    assert!(matches!(bob.recv().await, ServerEvent::ContactJoined { .. }));

    alice.vanish().await;

    // Nothing during the window.
    bob.expect_silence().await;
    assert_eq!(
        bob.recv().await,
        ServerEvent::ContactLeft {
            identity: id("alice")
        }
    );
    bob.expect_silence().await;
    assert!(!relay.state.registry.is_online(&id("alice")).await);
}

#[tokio::test]
async fn closing_one_tab_keeps_user_online() {
    let relay = start_relay().await;
    let (mut bob, _) = Client::setup(&relay, "bob", &["alice"]).await;
    let (tab1, _) = Client::setup(&relay, "alice", &["bob"]).await;
    let (_tab2, _) = Client::setup(&relay, "alice", &["bob"]).await;
    assert!(matches!(bob.recv().await, ServerEvent::ContactJoined { .. }));

    tab1.vanish().await;
    tokio::time::sleep(GRACE + QUIET).await;

    bob.expect_silence().await;
    assert!(relay.state.registry.is_online(&id("alice")).await);
}

#[tokio::test]
async fn explicit_disconnect_is_announced() {
    let relay = start_relay().await;
    let (mut bob, _) = Client::setup(&relay, "bob", &["alice"]).await;
    let (mut alice, _) = Client::setup(&relay, "alice", &["bob"]).await;
    assert!(matches!(bob.recv().await, ServerEvent::ContactJoined { .. }));

    alice.send(&ClientEvent::Disconnect).await;

    assert_eq!(
        bob.recv().await,
        ServerEvent::ContactLeft {
            identity: id("alice")
        }
    );
}

#[tokio::test]
async fn group_message_reaches_every_other_member_once() {
    let relay = start_relay().await;
    let (mut alice, _) = Client::setup(&relay, "alice", &[]).await;
    let (mut bob_tab1, _) = Client::setup(&relay, "bob", &[]).await;
    let (mut bob_tab2, _) = Client::setup(&relay, "bob", &[]).await;
    let (mut carol, _) = Client::setup(&relay, "carol", &[]).await;
    for client in [&mut alice, &mut bob_tab1, &mut bob_tab2, &mut carol] {
        client.join("group-1").await;
    }
    // A repeated join must not produce a second copy.
    carol.join("group-1").await;
    settle().await;

    alice.submit("group-1", "P").await;

    let expected = ServerEvent::MessageReceived {
        sender: id("alice"),
        channel: key("group-1"),
        payload: MessagePayload::text("P"),
    };
    for client in [&mut bob_tab1, &mut bob_tab2, &mut carol] {
        assert_eq!(client.recv().await, expected);
        client.expect_silence().await;
    }
    alice.expect_silence().await;
}

#[tokio::test]
async fn direct_message_uses_personal_channel() {
    let relay = start_relay().await;
    let (mut alice, _) = Client::setup(&relay, "alice", &[]).await;
    let (mut bob, _) = Client::setup(&relay, "bob", &[]).await;

    alice.submit("bob", "psst").await;

    assert_eq!(
        bob.recv().await,
        ServerEvent::MessageReceived {
            sender: id("alice"),
            channel: key("bob"),
            payload: MessagePayload::text("psst"),
        }
    );
    alice.expect_silence().await;
}

#[tokio::test]
async fn message_to_offline_user_is_silently_accepted() {
    let relay = start_relay().await;
    let (mut alice, _) = Client::setup(&relay, "alice", &[]).await;

    alice.submit("bob", "are you there?").await;

    alice.expect_silence().await;
    // The connection is still usable afterwards.
    let (mut bob, _) = Client::setup(&relay, "bob", &[]).await;
    alice.submit("bob", "there you are").await;
    assert!(matches!(
        bob.recv().await,
        ServerEvent::MessageReceived { payload, .. } if payload.formatted_text == "there you are"
    ));
}

#[tokio::test]
async fn membership_does_not_survive_reconnect() {
    let relay = start_relay().await;
    let (mut alice, _) = Client::setup(&relay, "alice", &[]).await;
    let (mut bob, _) = Client::setup(&relay, "bob", &[]).await;
    alice.join("group-1").await;
    bob.join("group-1").await;
    settle().await;

    // The new connection listens on its personal channel only until it
    // re-issues the join.
    alice.vanish().await;
    let (mut alice, _) = Client::setup(&relay, "alice", &[]).await;
    bob.submit("group-1", "hello?").await;
    alice.expect_silence().await;

    alice.join("group-1").await;
    settle().await;
    bob.submit("group-1", "now?").await;
    assert!(matches!(
        alice.recv().await,
        ServerEvent::MessageReceived { payload, .. } if payload.formatted_text == "now?"
    ));
}

#[tokio::test]
async fn sender_identity_comes_from_the_connection() {
    let relay = start_relay().await;
    let (mut mallory, _) = Client::setup(&relay, "mallory", &[]).await;
    let (mut bob, _) = Client::setup(&relay, "bob", &[]).await;

    // A second setup cannot rebind the connection to someone else.
    mallory
        .send(&ClientEvent::Setup {
            identity: id("alice"),
            contacts: vec![],
        })
        .await;
    assert!(matches!(mallory.recv().await, ServerEvent::Error { .. }));

    mallory.submit("bob", "it's alice, honest").await;
    assert!(matches!(
        bob.recv().await,
        ServerEvent::MessageReceived { sender, .. } if sender == id("mallory")
    ));
    assert!(!relay.state.registry.is_online(&id("alice")).await);
}
