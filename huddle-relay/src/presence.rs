//! Presence tracking over the connection registry.
//!
//! Presence is per identity, not per connection: contacts hear
//! `ContactJoined` on an identity's 0 → 1 connection transition and
//! `ContactLeft` only after its last connection has been gone for the whole
//! departure grace window. A reconnect inside the window cancels the pending
//! departure, so contacts never see a page reload as a departure. The
//! reconnect is still announced as an arrival: a contact that came online
//! during the window was told this identity was offline.
//!
//! The tracker does not know the social graph. Callers pass the contact list
//! the client supplied at setup.
//!
//! Arrivals, departures and timer expiry all run under the `departures`
//! lock, and each scheduled departure carries a generation number. A timer
//! that lost the race to a cancellation finds a different generation (or no
//! entry) and does nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use huddle_proto::event::ServerEvent;
use huddle_proto::identity::{ChannelKey, Identity};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::registry::{ConnectionId, ConnectionRegistry, Departure, OutboundSender};
use crate::relay::{Delivery, fan_out};
use crate::rooms::RoomMembership;

/// Default delay before announcing that a user went offline.
pub const DEFAULT_DEPARTURE_GRACE: Duration = Duration::from_secs(3);

/// Result of [`PresenceTracker::arrive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// Handle of the newly registered connection.
    pub handle: ConnectionId,
    /// Whether contacts should be told this identity came online (the
    /// identity's 0 → 1 transition).
    pub announce: bool,
    /// Whether this arrival cancelled a pending departure.
    pub resumed: bool,
}

struct PendingDeparture {
    generation: u64,
    contacts: Vec<Identity>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Departures {
    pending: HashMap<Identity, PendingDeparture>,
    next_generation: u64,
}

/// Derives contact presence from the registry and pushes presence events.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    departures: Mutex<Departures>,
    grace: Duration,
}

impl PresenceTracker {
    /// Creates a tracker with the given departure grace window.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            rooms,
            departures: Mutex::new(Departures::default()),
            grace,
        }
    }

    /// The configured departure grace window.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        self.grace
    }

    /// Registers a connection for `identity` and cancels any pending
    /// departure for it.
    ///
    /// Contacts are to be told about the arrival whenever this is the
    /// identity's only connection, including a reconnect that cancelled a
    /// departure. A repeated `ContactJoined` is harmless to a contact that
    /// already had the identity online.
    pub async fn arrive(&self, identity: &Identity, sender: OutboundSender) -> Arrival {
        let mut departures = self.departures.lock().await;
        let registration = self.registry.register(identity.clone(), sender).await;

        let resumed = registration.first
            && departures
                .pending
                .remove(identity)
                .map(|pending| pending.timer.abort())
                .is_some();
        drop(departures);

        if resumed {
            tracing::info!(identity = %identity, "reconnected within grace window, departure cancelled");
        }

        Arrival {
            handle: registration.handle,
            announce: registration.first,
            resumed,
        }
    }

    /// Unregisters a connection and, if it was the identity's last one,
    /// schedules the debounced `ContactLeft` for `contacts`.
    ///
    /// Returns `None` if the connection was already gone.
    pub async fn depart(
        self: &Arc<Self>,
        handle: ConnectionId,
        contacts: Vec<Identity>,
    ) -> Option<Departure> {
        let mut departures = self.departures.lock().await;
        let departure = self.registry.unregister(handle).await?;

        if departure.remaining == 0 {
            self.schedule(&mut departures, departure.identity.clone(), contacts);
        }
        drop(departures);

        Some(departure)
    }

    /// Cancels a pending departure for `identity`.
    ///
    /// Returns `false` if none was pending (never scheduled, already fired,
    /// or already cancelled).
    pub async fn cancel_departure(&self, identity: &Identity) -> bool {
        let mut departures = self.departures.lock().await;
        departures
            .pending
            .remove(identity)
            .map(|pending| pending.timer.abort())
            .is_some()
    }

    /// Number of departures waiting out their grace window.
    pub async fn pending_departures(&self) -> usize {
        self.departures.lock().await.pending.len()
    }

    /// The subset of `contacts` that is online, in the order given.
    ///
    /// Duplicates and `identity` itself are skipped.
    pub async fn online_among(&self, identity: &Identity, contacts: &[Identity]) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut online = Vec::new();
        for contact in contacts {
            if contact == identity || !seen.insert(contact) {
                continue;
            }
            if self.registry.is_online(contact).await {
                online.push(contact.clone());
            }
        }
        online
    }

    /// Tells every online contact that `identity` came online.
    pub async fn notify_joined(&self, identity: &Identity, contacts: &[Identity]) -> Delivery {
        let event = ServerEvent::ContactJoined {
            identity: identity.clone(),
        };
        let delivery = self.notify(identity, contacts, &event).await;
        tracing::info!(
            identity = %identity,
            delivered = delivery.delivered,
            "announced arrival"
        );
        delivery
    }

    /// Tells every online contact that `identity` went offline.
    ///
    /// Does nothing while `identity` still has an open connection.
    pub async fn notify_left(&self, identity: &Identity, contacts: &[Identity]) -> Delivery {
        if self.registry.is_online(identity).await {
            tracing::debug!(identity = %identity, "still connected, not announcing departure");
            return Delivery::default();
        }
        let event = ServerEvent::ContactLeft {
            identity: identity.clone(),
        };
        let delivery = self.notify(identity, contacts, &event).await;
        tracing::info!(
            identity = %identity,
            delivered = delivery.delivered,
            "announced departure"
        );
        delivery
    }

    /// Pushes `event` to the personal channel of each distinct contact.
    async fn notify(
        &self,
        identity: &Identity,
        contacts: &[Identity],
        event: &ServerEvent,
    ) -> Delivery {
        let mut seen = HashSet::new();
        let mut total = Delivery::default();
        for contact in contacts {
            if contact == identity || !seen.insert(contact) {
                continue;
            }
            let members = self.rooms.members_of(&ChannelKey::personal(contact)).await;
            let delivery = fan_out(&self.registry, &members, event.clone(), Some(identity)).await;
            total.delivered += delivery.delivered;
            total.dropped += delivery.dropped;
        }
        total
    }

    /// Starts the grace timer for `identity`, replacing any earlier one.
    fn schedule(self: &Arc<Self>, departures: &mut Departures, identity: Identity, contacts: Vec<Identity>) {
        departures.next_generation += 1;
        let generation = departures.next_generation;

        let tracker = Arc::clone(self);
        let timer_identity = identity.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            tracker.expire(&timer_identity, generation).await;
        });

        tracing::debug!(
            identity = %identity,
            grace_ms = self.grace.as_millis(),
            "last connection closed, departure scheduled"
        );
        let previous = departures.pending.insert(
            identity,
            PendingDeparture {
                generation,
                contacts,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }

    /// Timer callback: announces the departure unless it was cancelled.
    async fn expire(&self, identity: &Identity, generation: u64) {
        let mut departures = self.departures.lock().await;
        let current = departures
            .pending
            .get(identity)
            .is_some_and(|pending| pending.generation == generation);
        if !current {
            return;
        }
        let Some(pending) = departures.pending.remove(identity) else {
            return;
        };
        // Announce while still holding the lock so a concurrent arrival
        // cannot slip its ContactJoined in ahead of this ContactLeft.
        self.notify_left(identity, &pending.contacts).await;
        drop(departures);
    }
}
