//! Protocol version announced in `connected` and checked on `?version=`.
//!
//! Clients only name a major version; any minor of the same major works.

use std::fmt;

/// The version this build speaks.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Bumped on wire-incompatible frame changes.
    pub major: u8,
    /// Bumped when frames or fields are added.
    pub minor: u8,
}

impl Version {
    /// Whether a client speaking `major` can connect.
    #[must_use]
    pub fn accepts_major(&self, major: u8) -> bool {
        self.major == major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
