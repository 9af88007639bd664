//! Identity and channel key newtypes.
//!
//! Both are plain strings on the wire. A user's own [`Identity`] doubles as
//! the key of their personal channel, so direct delivery to `bob` is simply a
//! submit to the channel named `bob`.

use serde::{Deserialize, Serialize};

/// Maximum length in bytes of an identity or channel key.
pub const MAX_KEY_LEN: usize = 128;

/// Errors produced when validating an identity or channel key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The value is empty or only whitespace.
    #[error("value is empty")]
    Empty,
    /// The value exceeds [`MAX_KEY_LEN`] bytes.
    #[error("value is {0} bytes (max {MAX_KEY_LEN})")]
    TooLong(usize),
    /// The value contains a control character.
    #[error("value contains control characters")]
    ControlCharacter,
}

fn check(value: &str) -> Result<(), IdentityError> {
    if value.trim().is_empty() {
        return Err(IdentityError::Empty);
    }
    if value.len() > MAX_KEY_LEN {
        return Err(IdentityError::TooLong(value.len()));
    }
    if value.chars().any(char::is_control) {
        return Err(IdentityError::ControlCharacter);
    }
    Ok(())
}

/// A verified user identifier handed to the relay by the auth layer.
///
/// Deserialization does not validate; callers receiving an identity from a
/// client call [`Identity::validate`] before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Creates a validated identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the value is empty, too long, or contains
    /// control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        check(&value)?;
        Ok(Self(value))
    }

    /// Checks an identity that arrived over the wire.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Identity::new`].
    pub fn validate(&self) -> Result<(), IdentityError> {
        check(&self.0)
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names a channel: a direct chat id, a group chat id, or a personal
/// channel named after an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Creates a validated channel key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] under the same rules as identities.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        check(&value)?;
        Ok(Self(value))
    }

    /// The personal channel of `identity`.
    #[must_use]
    pub fn personal(identity: &Identity) -> Self {
        Self(identity.0.clone())
    }

    /// Checks a channel key that arrived over the wire.
    ///
    /// # Errors
    ///
    /// Same conditions as [`ChannelKey::new`].
    pub fn validate(&self) -> Result<(), IdentityError> {
        check(&self.0)
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
