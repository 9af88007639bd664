//! Room membership: which connections are listening on which channel.
//!
//! Membership is session-scoped. It is never persisted and never consulted
//! to decide who is *allowed* in a chat; it only answers who is listening
//! right now. Clients rebuild it by re-issuing joins after a reconnect.

use std::collections::{HashMap, HashSet};

use huddle_proto::identity::ChannelKey;
use tokio::sync::RwLock;

use crate::registry::ConnectionId;

/// Default cap on channels a single connection may listen on.
pub const DEFAULT_MAX_CHANNELS_PER_CONNECTION: usize = 1024;

/// Errors that can occur when joining a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// The connection already listens on the maximum number of channels.
    #[error("connection already joined {limit} channels")]
    ChannelLimit {
        /// The configured cap.
        limit: usize,
    },
}

#[derive(Default)]
pub(crate) struct Inner {
    members: HashMap<ChannelKey, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<ChannelKey>>,
}

/// Channel → listening connections, with the reverse index for teardown.
pub struct RoomMembership {
    inner: RwLock<Inner>,
    max_channels_per_connection: usize,
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomMembership {
    /// Creates an empty membership map with the default per-connection cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_channel_limit(DEFAULT_MAX_CHANNELS_PER_CONNECTION)
    }

    /// Creates an empty membership map with a custom per-connection cap.
    #[must_use]
    pub fn with_channel_limit(max_channels_per_connection: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_channels_per_connection,
        }
    }

    /// Adds `handle` to `channel`.
    ///
    /// Returns `true` if the connection was newly added, `false` if it was
    /// already a member.
    ///
    /// # Errors
    ///
    /// Returns [`MembershipError::ChannelLimit`] if the connection already
    /// listens on the maximum number of channels.
    pub async fn join(
        &self,
        channel: &ChannelKey,
        handle: ConnectionId,
    ) -> Result<bool, MembershipError> {
        let mut inner = self.inner.write().await;

        let joined = inner.joined.get(&handle);
        if joined.is_some_and(|joined| joined.contains(channel)) {
            return Ok(false);
        }
        if joined.map_or(0, HashSet::len) >= self.max_channels_per_connection {
            return Err(MembershipError::ChannelLimit {
                limit: self.max_channels_per_connection,
            });
        }
        inner
            .joined
            .entry(handle)
            .or_default()
            .insert(channel.clone());
        inner
            .members
            .entry(channel.clone())
            .or_default()
            .insert(handle);
        drop(inner);

        Ok(true)
    }

    /// Removes `handle` from `channel`.
    ///
    /// Returns `true` if the connection was a member.
    pub async fn leave(&self, channel: &ChannelKey, handle: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;

        let was_member = inner
            .joined
            .get_mut(&handle)
            .is_some_and(|joined| joined.remove(channel));
        if !was_member {
            return false;
        }
        if inner.joined.get(&handle).is_some_and(HashSet::is_empty) {
            inner.joined.remove(&handle);
        }
        remove_member(&mut inner.members, channel, handle);
        drop(inner);

        true
    }

    /// Removes `handle` from every channel, returning the channels it left.
    pub async fn leave_all(&self, handle: ConnectionId) -> Vec<ChannelKey> {
        let mut inner = self.inner.write().await;

        let Some(joined) = inner.joined.remove(&handle) else {
            return Vec::new();
        };
        for channel in &joined {
            remove_member(&mut inner.members, channel, handle);
        }
        drop(inner);

        joined.into_iter().collect()
    }

    /// Connections currently listening on `channel`.
    pub async fn members_of(&self, channel: &ChannelKey) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .members
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Channels `handle` is listening on.
    pub async fn channels_of(&self, handle: ConnectionId) -> Vec<ChannelKey> {
        let inner = self.inner.read().await;
        inner
            .joined
            .get(&handle)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of channels with at least one listener.
    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.members.len()
    }

    /// Number of connections listening on at least one channel.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.joined.len()
    }

    /// Takes the membership lock, stalling every join and leave until the
    /// guard is dropped.
    #[cfg(test)]
    pub(crate) async fn stall(&self) -> tokio::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().await
    }
}

/// Drops `handle` from a channel's member set, removing the channel once empty.
fn remove_member(
    members: &mut HashMap<ChannelKey, HashSet<ConnectionId>>,
    channel: &ChannelKey,
    handle: ConnectionId,
) {
    if let Some(set) = members.get_mut(channel) {
        set.remove(&handle);
        if set.is_empty() {
            members.remove(channel);
        }
    }
}
