//! Network and endpoint identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{KeelError, KeelResult};

/// Maximum length of a network or endpoint id.
pub const MAX_ID_LENGTH: usize = 64;

fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return false;
    }

    let mut chars = id.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A validated network identifier.
///
/// Network IDs are opaque, caller-supplied tokens. They must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(String);

impl NetworkId {
    /// Create a new network ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::InvalidNetworkId`] if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> KeelResult<Self> {
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(KeelError::InvalidNetworkId { id });
        }
        Ok(Self(id))
    }

    /// Get the network ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A validated endpoint identifier, unique within its network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Create a new endpoint ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::InvalidEndpointId`] if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> KeelResult<Self> {
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(KeelError::InvalidEndpointId { id });
        }
        Ok(Self(id))
    }

    /// Get the endpoint ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl FromStr for EndpointId {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NetworkId {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = KeelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NetworkId> for String {
    fn from(id: NetworkId) -> Self {
        id.0
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

impl AsRef<str> for NetworkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
