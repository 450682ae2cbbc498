use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use paramsync_core::{AuthError, Principal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default)]
    anonymous: bool,
    iat: i64,
    exp: i64,
}

/// Issues and verifies the bearer tokens clients present on the `auth`
/// handshake message. One instance per process, built from [`crate::config::Config`].
#[derive(Clone)]
pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    expiration: chrono::Duration,
}

impl TokenVerifier {
    pub fn new(secret: &str, algorithm: Algorithm, expiration: std::time::Duration) -> Self {
        TokenVerifier {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            expiration: chrono::Duration::from_std(expiration).unwrap_or(chrono::Duration::hours(24)),
        }
    }

    /// Issue a fresh token for a principal, valid for this verifier's
    /// configured expiration.
    pub fn issue(&self, user_id: &str, name: &str, email: Option<&str>, anonymous: bool) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            name: name.to_string(),
            email: email.map(str::to_string),
            anonymous,
            iat: now.timestamp(),
            exp: (now + self.expiration).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|_| AuthError::Invalid)
    }

    /// Verify a bearer token and extract the principal it carries.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_required_spec_claims(&["sub", "exp"]);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;

        let expires_at = DateTime::from_timestamp(data.claims.exp, 0).ok_or(AuthError::Invalid)?;
        Ok(Principal {
            user_id: data.claims.sub,
            display_name: data.claims.name,
            email: data.claims.email,
            anonymous: data.claims.anonymous,
            expires_at,
        })
    }

    /// Issue a replacement token for an already-valid principal, extending
    /// its expiration without requiring the caller to re-authenticate.
    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let principal = self.verify(token)?;
        self.issue(
            &principal.user_id,
            &principal.display_name,
            principal.email.as_deref(),
            principal.anonymous,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-secret-key", Algorithm::HS256, Duration::from_secs(3600))
    }

    #[test]
    fn issue_then_verify_round_trips_identity() {
        let v = verifier();
        let token = v.issue("user-1", "Alice", Some("alice@example.com"), false).unwrap();
        let principal = v.verify(&token).unwrap();
        assert_eq!(principal.user_id, "user-1");
        assert_eq!(principal.display_name, "Alice");
        assert!(!principal.anonymous);
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let v1 = verifier();
        let v2 = TokenVerifier::new("different-secret", Algorithm::HS256, Duration::from_secs(3600));
        let token = v1.issue("user-1", "Alice", None, false).unwrap();
        assert_eq!(v2.verify(&token), Err(AuthError::Invalid));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let v = TokenVerifier::new("test-secret-key", Algorithm::HS256, Duration::from_secs(0));
        let token = v.issue("user-1", "Alice", None, false).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(v.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn refresh_preserves_identity_with_new_token() {
        let v = verifier();
        let token = v.issue("user-1", "Alice", None, true).unwrap();
        let refreshed = v.refresh(&token).unwrap();
        let principal = v.verify(&refreshed).unwrap();
        assert_eq!(principal.user_id, "user-1");
        assert!(principal.anonymous);
    }
}
