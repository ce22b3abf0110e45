//! Core identifier types for harbor.
//!
//! Application names double as record keys, directory names and DNS labels,
//! so they are validated once at the edge and carried as [`AppName`] from then on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of an application name (one DNS label).
pub const MAX_APP_NAME_LEN: usize = 63;

/// A validated application name.
///
/// Names are lowercase ASCII letters, digits and `-`, must not start or end
/// with `-`, and are at most 63 characters long. This keeps them safe to use
/// as a path component and as the leftmost label of `{name}.{host domain}`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    /// Validate and wrap an application name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, too long, or contains characters
    /// outside `[a-z0-9-]`.
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IdError::EmptyName);
        }
        if name.len() > MAX_APP_NAME_LEN {
            return Err(IdError::NameTooLong {
                max: MAX_APP_NAME_LEN,
                got: name.len(),
            });
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(IdError::InvalidNameChar(c));
        }
        if name.starts_with('-') || name.ends_with('-') {
            return Err(IdError::InvalidNameChar('-'));
        }
        Ok(Self(name))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the name as bytes, used for record keys.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppName({})", self.0)
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AppName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AppName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AppName> for String {
    fn from(name: AppName) -> Self {
        name.0
    }
}

impl AsRef<str> for AppName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A 32-byte host identifier, the blake3 hash of the host's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostId([u8; 32]);

impl HostId {
    /// Create a new `HostId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the `HostId` for a public key.
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Parse a `HostId` from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 64 characters.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 32,
            got: s.len() / 2,
        })?;
        Ok(Self(arr))
    }

    /// Return the underlying bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Return the hex-encoded string representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.to_hex())
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for HostId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<HostId> for String {
    fn from(id: HostId) -> Self {
        id.to_hex()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The application name is empty.
    #[error("app name must not be empty")]
    EmptyName,

    /// The application name exceeds the DNS label limit.
    #[error("app name too long: at most {max} characters, got {got}")]
    NameTooLong {
        /// The maximum allowed length.
        max: usize,
        /// The actual length.
        got: usize,
    },

    /// The application name contains a disallowed character.
    #[error("app name contains invalid character {0:?}")]
    InvalidNameChar(char),
}
