//! Relay core: shared state and channel fan-out.
//!
//! [`RelayState`] owns the connection registry, room membership and
//! presence tracker for the lifetime of the server and is handed to every
//! connection handler by reference. [`MessageRelay`] pushes submitted
//! messages to whoever is listening on the target channel.

use std::sync::Arc;

use huddle_proto::event::{MessagePayload, ServerEvent};
use huddle_proto::identity::{ChannelKey, Identity};

use crate::config::RelayConfig;
use crate::presence::PresenceTracker;
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound, PushError};
use crate::rooms::RoomMembership;

/// Default maximum allowed frame size in bytes (64 KB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the event was queued for.
    pub delivered: usize,
    /// Members skipped because they were unregistered or already closing.
    pub dropped: usize,
}

/// Pushes `event` to each of `members`, skipping connections bound to
/// `exclude`.
///
/// Every send is an independent, non-blocking queue push, so a slow client
/// never holds up the others. Failed pushes are logged and not retried; a
/// member whose queue is full is closed.
pub(crate) async fn fan_out(
    registry: &ConnectionRegistry,
    members: &[ConnectionId],
    event: ServerEvent,
    exclude: Option<&Identity>,
) -> Delivery {
    let mut delivery = Delivery::default();
    if members.is_empty() {
        return delivery;
    }

    let event = Arc::new(event);
    for (handle, route) in registry.routes(members).await {
        let Some(route) = route else {
            tracing::warn!(
                connection = %handle,
                "channel member missing from registry, dropping its delivery"
            );
            delivery.dropped += 1;
            continue;
        };
        if exclude == Some(&route.identity) {
            continue;
        }
        match route.sender.push(Outbound::Event(Arc::clone(&event))) {
            Ok(()) => delivery.delivered += 1,
            Err(PushError::Full) => {
                tracing::warn!(
                    connection = %handle,
                    identity = %route.identity,
                    "outbound queue full, dropping delivery and closing connection"
                );
                delivery.dropped += 1;
            }
            Err(PushError::Closed) => {
                tracing::debug!(
                    connection = %handle,
                    identity = %route.identity,
                    "connection closing, delivery dropped"
                );
                delivery.dropped += 1;
            }
        }
    }
    delivery
}

/// Forwards submitted messages to the current listeners of a channel.
///
/// The relay trusts its caller for the channel key (the message has already
/// been checked against the persisted chat) and trusts [`RoomMembership`]
/// for who is listening. It never consults the chat graph itself.
pub struct MessageRelay {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
}

impl MessageRelay {
    /// Creates a relay over the given registry and membership.
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<RoomMembership>) -> Self {
        Self { registry, rooms }
    }

    /// Pushes a message to every listener of `channel` except the sender's
    /// own connections.
    ///
    /// A channel with no listeners is a normal state (the recipient is
    /// offline) and yields an empty [`Delivery`].
    pub async fn submit(
        &self,
        sender: &Identity,
        channel: &ChannelKey,
        payload: MessagePayload,
    ) -> Delivery {
        let members = self.rooms.members_of(channel).await;
        let event = ServerEvent::MessageReceived {
            sender: sender.clone(),
            channel: channel.clone(),
            payload,
        };
        let delivery = fan_out(&self.registry, &members, event, Some(sender)).await;

        tracing::debug!(
            sender = %sender,
            channel = %channel,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "message relayed"
        );
        delivery
    }
}

/// Shared relay server state.
pub struct RelayState {
    /// Open connections by handle and identity.
    pub registry: Arc<ConnectionRegistry>,
    /// Channel listeners.
    pub rooms: Arc<RoomMembership>,
    /// Presence queries, notifications and departure timers.
    pub presence: Arc<PresenceTracker>,
    /// Channel fan-out.
    pub relay: MessageRelay,
    /// Maximum allowed inbound frame size in bytes.
    max_payload_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with default limits and departure grace.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    /// Creates relay state from a resolved configuration.
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomMembership::with_channel_limit(
            config.max_channels_per_connection,
        ));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            config.departure_grace,
        ));
        let relay = MessageRelay::new(Arc::clone(&registry), Arc::clone(&rooms));

        Self {
            registry,
            rooms,
            presence,
            relay,
            max_payload_size: config.max_payload_size,
        }
    }

    /// Maximum allowed inbound frame size in bytes.
    #[must_use]
    pub const fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Sends a close frame to every connected client.
    ///
    /// Used for graceful shutdown; each handler then tears its connection
    /// down through the normal close path.
    pub async fn close_all_connections(&self) {
        self.registry.close_all().await;
    }
}
