//! Per-connection lifecycle: `Connecting → Bound → Joined → Closed`.
//!
//! A [`Session`] is driven by decoded [`ClientEvent`]s and knows nothing about
//! WebSockets, so the whole state machine can be exercised without a network.
//! The server module feeds it frames and tears it down when the transport
//! closes.

use std::sync::Arc;

use huddle_proto::codec::CodecError;
use huddle_proto::event::{ClientEvent, MessagePayload, ServerEvent};
use huddle_proto::identity::{ChannelKey, Identity, IdentityError};

use crate::registry::{ConnectionId, Outbound, OutboundSender};
use crate::relay::{Delivery, RelayState};
use crate::rooms::MembershipError;

/// Errors raised while handling a client event.
///
/// Only [`SessionError::AuthenticationMissing`] ends the connection; every
/// other error is logged and the connection carries on.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The setup event was missing or carried an invalid identity.
    #[error("setup rejected: {reason}")]
    AuthenticationMissing {
        /// Why the setup was rejected.
        reason: String,
    },
    /// A channel or message operation arrived before setup completed.
    #[error("connection is not set up")]
    NotBound,
    /// A second setup arrived on a bound connection.
    #[error("connection is already set up")]
    AlreadyBound,
    /// The channel key is not valid.
    #[error("invalid channel key: {0}")]
    InvalidChannel(#[source] IdentityError),
    /// The join was refused by room membership.
    #[error(transparent)]
    Membership(#[from] MembershipError),
    /// The frame exceeds the configured size limit.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Frame size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The frame could not be decoded.
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
    /// The registry no longer knows this bound connection.
    #[error("connection {connection} is missing from the registry")]
    InternalInconsistency {
        /// The connection whose registry entry vanished.
        connection: ConnectionId,
    },
}

impl SessionError {
    /// Whether the connection must be closed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationMissing { .. })
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, no setup yet.
    Connecting,
    /// Setup complete, listening on the personal channel only.
    Bound,
    /// Listening on at least one channel besides the personal one.
    Joined,
    /// Torn down; terminal.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Bound => write!(f, "bound"),
            Self::Joined => write!(f, "joined"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What the transport should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Close the connection.
    Close,
}

struct Binding {
    handle: ConnectionId,
    identity: Identity,
    contacts: Vec<Identity>,
}

enum Phase {
    Connecting,
    Bound(Binding),
    Closed,
}

/// Lifecycle controller for one client connection.
pub struct Session {
    state: Arc<RelayState>,
    outbound: OutboundSender,
    phase: Phase,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    ///
    /// `outbound` is the queue drained by this connection's writer.
    #[must_use]
    pub const fn new(state: Arc<RelayState>, outbound: OutboundSender) -> Self {
        Self {
            state,
            outbound,
            phase: Phase::Connecting,
        }
    }

    /// Identity bound at setup, if any.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        match &self.phase {
            Phase::Bound(binding) => Some(&binding.identity),
            Phase::Connecting | Phase::Closed => None,
        }
    }

    /// Registry handle assigned at setup, if any.
    #[must_use]
    pub const fn handle(&self) -> Option<ConnectionId> {
        match &self.phase {
            Phase::Bound(binding) => Some(binding.handle),
            Phase::Connecting | Phase::Closed => None,
        }
    }

    /// Current lifecycle state.
    pub async fn connection_state(&self) -> ConnectionState {
        match &self.phase {
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Closed => ConnectionState::Closed,
            Phase::Bound(binding) => {
                let personal = ChannelKey::personal(&binding.identity);
                let joined = self
                    .state
                    .rooms
                    .channels_of(binding.handle)
                    .await
                    .into_iter()
                    .any(|channel| channel != personal);
                if joined {
                    ConnectionState::Joined
                } else {
                    ConnectionState::Bound
                }
            }
        }
    }

    /// Handles one decoded client event.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the event is rejected. Callers close
    /// the connection if [`SessionError::is_fatal`] holds and otherwise keep
    /// reading.
    pub async fn handle_event(&mut self, event: ClientEvent) -> Result<Flow, SessionError> {
        match event {
            ClientEvent::Setup { identity, contacts } => {
                self.setup(identity, contacts).await?;
            }
            ClientEvent::JoinChannel { channel } => self.join_channel(&channel).await?,
            ClientEvent::LeaveChannel { channel } => self.leave_channel(&channel).await?,
            ClientEvent::SubmitMessage { channel, payload } => {
                self.submit(&channel, payload).await?;
            }
            ClientEvent::Disconnect => {
                self.close().await;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Binds the connection to `identity` and announces it.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AuthenticationMissing`] if the identity is invalid;
    ///   nothing is registered.
    /// - [`SessionError::AlreadyBound`] on a second setup.
    pub async fn setup(
        &mut self,
        identity: Identity,
        contacts: Vec<Identity>,
    ) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Connecting) {
            return Err(SessionError::AlreadyBound);
        }
        identity
            .validate()
            .map_err(|e| SessionError::AuthenticationMissing {
                reason: format!("invalid identity: {e}"),
            })?;
        let contacts = valid_contacts(&identity, contacts);

        let presence = &self.state.presence;
        let arrival = presence.arrive(&identity, self.outbound.clone()).await;

        // Bound before the next await, so `close` finds the registration even
        // if this future is dropped part way through.
        self.phase = Phase::Bound(Binding {
            handle: arrival.handle,
            identity: identity.clone(),
            contacts: contacts.clone(),
        });

        // Join the personal channel before asking who is online, so a contact
        // arriving concurrently either shows up in the reply or announces
        // itself to this connection.
        if let Err(e) = self
            .state
            .rooms
            .join(&ChannelKey::personal(&identity), arrival.handle)
            .await
        {
            tracing::warn!(identity = %identity, error = %e, "could not join personal channel");
        }

        let online = presence.online_among(&identity, &contacts).await;
        tracing::info!(
            identity = %identity,
            connection = %arrival.handle,
            contacts = contacts.len(),
            online = online.len(),
            resumed = arrival.resumed,
            "connection bound"
        );
        self.push(ServerEvent::OnlineContacts { identities: online });

        if arrival.announce {
            presence.notify_joined(&identity, &contacts).await;
        }
        Ok(())
    }

    /// Starts listening on `channel`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotBound`], [`SessionError::InvalidChannel`],
    /// [`SessionError::Membership`] or [`SessionError::InternalInconsistency`].
    pub async fn join_channel(&self, channel: &ChannelKey) -> Result<(), SessionError> {
        let binding = self.binding()?;
        channel.validate().map_err(SessionError::InvalidChannel)?;
        self.ensure_registered(binding).await?;

        let added = self.state.rooms.join(channel, binding.handle).await?;
        tracing::debug!(
            identity = %binding.identity,
            channel = %channel,
            added,
            "joined channel"
        );
        Ok(())
    }

    /// Stops listening on `channel`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotBound`] or [`SessionError::InvalidChannel`].
    pub async fn leave_channel(&self, channel: &ChannelKey) -> Result<(), SessionError> {
        let binding = self.binding()?;
        channel.validate().map_err(SessionError::InvalidChannel)?;

        let removed = self.state.rooms.leave(channel, binding.handle).await;
        tracing::debug!(
            identity = %binding.identity,
            channel = %channel,
            removed,
            "left channel"
        );
        Ok(())
    }

    /// Relays a message to the listeners of `channel`.
    ///
    /// The sender is this connection's bound identity.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotBound`], [`SessionError::InvalidChannel`] or
    /// [`SessionError::InternalInconsistency`].
    pub async fn submit(
        &self,
        channel: &ChannelKey,
        payload: MessagePayload,
    ) -> Result<Delivery, SessionError> {
        let binding = self.binding()?;
        channel.validate().map_err(SessionError::InvalidChannel)?;
        self.ensure_registered(binding).await?;

        Ok(self
            .state
            .relay
            .submit(&binding.identity, channel, payload)
            .await)
    }

    /// Tears the connection down: leaves every channel, unregisters, and
    /// schedules the departure announcement if this was the identity's last
    /// connection. Idempotent.
    pub async fn close(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Closed);
        let Phase::Bound(binding) = phase else {
            return;
        };

        let channels = self.state.rooms.leave_all(binding.handle).await;
        let departure = self
            .state
            .presence
            .depart(binding.handle, binding.contacts)
            .await;

        tracing::info!(
            identity = %binding.identity,
            connection = %binding.handle,
            channels = channels.len(),
            remaining = departure.map_or(0, |d| d.remaining),
            "connection closed"
        );
    }

    /// Sends an error event to this connection.
    pub fn report(&self, error: &SessionError) {
        self.push(ServerEvent::Error {
            reason: error.to_string(),
        });
    }

    fn push(&self, event: ServerEvent) {
        let _ = self.outbound.push(Outbound::Event(Arc::new(event)));
    }

    const fn binding(&self) -> Result<&Binding, SessionError> {
        match &self.phase {
            Phase::Bound(binding) => Ok(binding),
            Phase::Connecting | Phase::Closed => Err(SessionError::NotBound),
        }
    }

    async fn ensure_registered(&self, binding: &Binding) -> Result<(), SessionError> {
        if self.state.registry.identity_of(binding.handle).await.is_some() {
            Ok(())
        } else {
            Err(SessionError::InternalInconsistency {
                connection: binding.handle,
            })
        }
    }
}

/// Drops invalid entries, duplicates and the identity itself.
fn valid_contacts(identity: &Identity, contacts: Vec<Identity>) -> Vec<Identity> {
    let mut kept: Vec<Identity> = Vec::with_capacity(contacts.len());
    for contact in contacts {
        if let Err(e) = contact.validate() {
            tracing::debug!(identity = %identity, error = %e, "ignoring invalid contact");
            continue;
        }
        if &contact != identity && !kept.contains(&contact) {
            kept.push(contact);
        }
    }
    kept
}
