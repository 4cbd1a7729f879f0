//! Stateless HS256 bearer tokens.

use super::AuthError;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Token handed to a client after a successful login.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Encoded JWT.
    pub token: String,
    /// Expiry carried in the token.
    pub expires_at: OffsetDateTime,
}

/// Signs and verifies bearer tokens with a shared secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenSigner {
    /// Build a signer. A negative `ttl` issues tokens that are already expired.
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Issue a token for `user_id`.
    pub fn issue(&self, user_id: &str) -> Result<IssuedToken, AuthError> {
        let now = OffsetDateTime::now_utc();
        let expires_at = now.saturating_add(self.ttl);
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature and expiry, returning the user id.
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::TokenMalformed("empty bearer token".into()));
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenMalformed(err.to_string()),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::TokenMalformed("token has no subject".into()));
        }
        Ok(data.claims.sub)
    }
}
