//! JWT-backed identity verification.
//!
//! Bearer tokens are HS256 JWTs signed with a shared secret. The subject may
//! be carried as `sub` or `id`, as a string or an integer.

use crate::identity::{AuthError, AuthFailure, IdentityVerifier, UserId};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Token subject: user IDs may be strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Text(String),
    Number(i64),
}

impl From<Subject> for UserId {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::Text(s) => UserId::new(s),
            Subject::Number(n) => UserId::new(n.to_string()),
        }
    }
}

/// JWT claims accepted by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    #[serde(alias = "id")]
    pub sub: Subject,
    /// Email, if the issuer included it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued at (Unix seconds).
    #[serde(default)]
    pub iat: i64,
    /// Expiration (Unix seconds).
    pub exp: i64,
}

/// HS256 JWT verifier and issuer.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for the given shared secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Set the clock skew tolerated when checking `exp`.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway.as_secs();
        self
    }

    /// Issue a token for `user` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, user: &UserId, ttl: Duration) -> Result<String, AuthError> {
        let now = unix_now();
        let claims = Claims {
            sub: Subject::Text(user.as_str().to_string()),
            email: None,
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        self.issue_claims(&claims)
    }

    /// Sign arbitrary claims.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue_claims(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }

    /// Decode and validate a token, returning its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidOrExpired`] on any validation failure.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let failure = match e.kind() {
                    ErrorKind::ExpiredSignature => AuthFailure::Expired,
                    ErrorKind::InvalidSignature
                    | ErrorKind::InvalidAlgorithm
                    | ErrorKind::ImmatureSignature => AuthFailure::BadSignature,
                    _ => AuthFailure::Malformed,
                };
                debug!(error = %e, %failure, "Token rejected");
                AuthError::InvalidOrExpired(failure)
            })
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, credential: Option<&str>) -> Result<UserId, AuthError> {
        let token = match credential.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::InvalidOrExpired(AuthFailure::Missing)),
        };

        let claims = self.decode(token)?;
        let user = UserId::from(claims.sub);
        if user.as_str().is_empty() {
            return Err(AuthError::InvalidOrExpired(AuthFailure::Malformed));
        }
        Ok(user)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_issue_and_verify() {
        let verifier = JwtVerifier::new(SECRET);
        let token = verifier
            .issue(&UserId::new("alice"), Duration::from_secs(60))
            .unwrap();

        assert_eq!(verifier.verify(Some(&token)).unwrap(), UserId::new("alice"));
    }

    #[test]
    fn test_missing_credential() {
        let verifier = JwtVerifier::new(SECRET);

        for credential in [None, Some(""), Some("   ")] {
            let err = verifier.verify(credential).unwrap_err();
            assert_eq!(err.failure(), Some(AuthFailure::Missing));
        }
    }

    #[test]
    fn test_malformed_credential() {
        let verifier = JwtVerifier::new(SECRET);
        let err = verifier.verify(Some("not-a-jwt")).unwrap_err();
        assert_eq!(err.failure(), Some(AuthFailure::Malformed));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let issuer = JwtVerifier::new(b"other-secret");
        let token = issuer
            .issue(&UserId::new("mallory"), Duration::from_secs(60))
            .unwrap();

        let err = JwtVerifier::new(SECRET).verify(Some(&token)).unwrap_err();
        assert_eq!(err.failure(), Some(AuthFailure::BadSignature));
    }

    #[test]
    fn test_expired_credential() {
        let verifier = JwtVerifier::new(SECRET).with_leeway(Duration::ZERO);
        let now = unix_now();
        let token = verifier
            .issue_claims(&Claims {
                sub: Subject::Text("alice".into()),
                email: None,
                iat: now - 7200,
                exp: now - 3600,
            })
            .unwrap();

        let err = verifier.verify(Some(&token)).unwrap_err();
        assert_eq!(err.failure(), Some(AuthFailure::Expired));
    }

    #[test]
    fn test_integer_id_claim() {
        let verifier = JwtVerifier::new(SECRET);
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "id": 42, "email": "a@example.com", "exp": unix_now() + 60 }),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert_eq!(verifier.verify(Some(&token)).unwrap(), UserId::new("42"));
    }
}
