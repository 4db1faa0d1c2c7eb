//! User identity and credential verification.
//!
//! A connection only reaches the presence registry after its credential has
//! been turned into a [`UserId`] by an [`IdentityVerifier`].

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

/// Stable user identifier issued by the authentication service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the ID, returning the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for UserId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Why a credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No credential accompanied the handshake.
    Missing,
    /// The credential could not be parsed.
    Malformed,
    /// The credential was valid once but has expired.
    Expired,
    /// The signature or claims did not check out.
    BadSignature,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthFailure::Missing => "missing",
            AuthFailure::Malformed => "malformed",
            AuthFailure::Expired => "expired",
            AuthFailure::BadSignature => "bad signature",
        };
        f.write_str(s)
    }
}

/// Authentication errors.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The credential is missing, malformed, expired or tampered with.
    #[error("Invalid or expired credential ({0})")]
    InvalidOrExpired(AuthFailure),

    /// The verifier could not produce a credential.
    #[error("Credential issuing failed: {0}")]
    Issue(String),
}

impl AuthError {
    /// The failure detail, if this is a verification error.
    #[must_use]
    pub fn failure(&self) -> Option<AuthFailure> {
        match self {
            AuthError::InvalidOrExpired(failure) => Some(*failure),
            AuthError::Issue(_) => None,
        }
    }
}

/// Turns a connection credential into a user identity.
///
/// Verification is expected to be fast and local (a signature check); it
/// runs before any presence state is touched.
pub trait IdentityVerifier: Send + Sync {
    /// Verify a credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidOrExpired`] if the credential is missing,
    /// malformed, expired or tampered with.
    fn verify(&self, credential: Option<&str>) -> Result<UserId, AuthError>;
}
