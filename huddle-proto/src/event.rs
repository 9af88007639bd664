//! Events exchanged between clients and the relay.
//!
//! Enums use serde's default external tagging so the same types work for
//! postcard (binary frames) and JSON (text frames). Optional fields carry
//! `#[serde(default)]` so browser clients may omit them; they are never
//! skipped on serialization because postcard is not self-describing.

use serde::{Deserialize, Serialize};

use crate::identity::{ChannelKey, Identity};

/// Link preview metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkPreview {
    /// The previewed URL.
    pub url: String,
    /// Page title.
    #[serde(default)]
    pub title: Option<String>,
    /// Page description.
    #[serde(default)]
    pub description: Option<String>,
    /// Preview image URL.
    #[serde(default)]
    pub image: Option<String>,
}

/// Message content as persisted by the chat backend.
///
/// The relay never inspects any of this.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Id of the persisted message record, if the backend assigned one.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Serialized rich-text document.
    #[serde(default)]
    pub formatted_text: String,
    /// Stable reference to an uploaded attachment.
    #[serde(default)]
    pub attachment: Option<String>,
    /// Preview of a link contained in the message.
    #[serde(default)]
    pub link_preview: Option<LinkPreview>,
}

impl MessagePayload {
    /// A plain-text payload with no attachment or preview.
    #[must_use]
    pub fn text(formatted_text: impl Into<String>) -> Self {
        Self {
            formatted_text: formatted_text.into(),
            ..Self::default()
        }
    }
}

/// Events sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    /// First event on every connection: binds it to an identity.
    ///
    /// `contacts` is the caller's friend/co-member list, used both to answer
    /// which contacts are online and to decide whom to notify.
    Setup {
        /// The verified identity of this connection.
        identity: Identity,
        /// Identities whose presence this user follows.
        #[serde(default)]
        contacts: Vec<Identity>,
    },

    /// Start listening on a channel.
    JoinChannel {
        /// Channel to join.
        channel: ChannelKey,
    },

    /// Stop listening on a channel.
    LeaveChannel {
        /// Channel to leave.
        channel: ChannelKey,
    },

    /// Fan an already-persisted message out to a channel.
    ///
    /// The sender is taken from the connection, never from the event.
    SubmitMessage {
        /// Target channel.
        channel: ChannelKey,
        /// Opaque message content.
        payload: MessagePayload,
    },

    /// Graceful goodbye sent before the client closes the socket.
    Disconnect,
}

/// Events pushed by the relay to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `Setup`: the subset of the supplied contacts that is online.
    OnlineContacts {
        /// Online contacts, in the order they were supplied.
        identities: Vec<Identity>,
    },

    /// A contact came online.
    ContactJoined {
        /// The contact.
        identity: Identity,
    },

    /// A contact went offline (after the departure grace window).
    ContactLeft {
        /// The contact.
        identity: Identity,
    },

    /// A message submitted to a channel this connection listens on.
    MessageReceived {
        /// Identity of the submitting connection.
        sender: Identity,
        /// Channel the message was submitted to.
        channel: ChannelKey,
        /// Opaque message content.
        payload: MessagePayload,
    },

    /// The relay rejected something this connection sent.
    Error {
        /// Human-readable description.
        reason: String,
    },
}
