//! Credential authority.
//!
//! Users register with an id and password; the password is stored only as a salted bcrypt
//! hash. Logging in yields a self-verifying HS256 bearer token carrying the user id and an
//! expiry, so validating a token needs only the signing key and no session lookup. Ingress
//! and search call [`CredentialAuthority::validate_token`] before doing any work.

pub mod passwords;
pub mod tokens;
pub mod users;

use crate::error::PipelineError;
use std::sync::Arc;
use thiserror::Error;

pub use tokens::{IssuedToken, TokenSigner};
pub use users::{SqliteUserStore, UserRecord, UserStore, UserStoreError};

const MIN_PASSWORD_LEN: usize = 8;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Token signature is valid but its expiry has passed.
    #[error("token expired")]
    TokenExpired,
    /// Token is missing, unparsable, or signed with another key.
    #[error("malformed token: {0}")]
    TokenMalformed(String),
    /// Password hashing failed.
    #[error("password hashing failed: {0}")]
    Hashing(String),
    /// Token encoding failed.
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    /// Stable machine-readable kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenExpired => "token_expired",
            Self::TokenMalformed(_) => "token_malformed",
            Self::Hashing(_) | Self::Signing(_) => "auth_internal",
        }
    }
}

/// Issues and validates bearer tokens against stored credentials.
pub struct CredentialAuthority {
    users: Arc<dyn UserStore>,
    signer: TokenSigner,
    hash_cost: u32,
}

impl CredentialAuthority {
    /// Build an authority over a user store.
    pub fn new(users: Arc<dyn UserStore>, signer: TokenSigner, hash_cost: u32) -> Self {
        Self {
            users,
            signer,
            hash_cost,
        }
    }

    /// Create a user. Duplicate ids and short passwords are validation errors.
    pub async fn register(&self, user_id: &str, password: &str) -> Result<(), PipelineError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(PipelineError::Validation("user id is required".into()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(PipelineError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let password_hash = passwords::hash_password(password, self.hash_cost).await?;
        let record = UserRecord {
            user_id: user_id.to_string(),
            password_hash,
        };
        self.users.insert(&record).await?;
        tracing::info!(user_id, "Registered user");
        Ok(())
    }

    /// Exchange a user id and password for a bearer token.
    pub async fn issue_token(
        &self,
        user_id: &str,
        password: &str,
    ) -> Result<IssuedToken, PipelineError> {
        let Some(record) = self.users.find(user_id.trim()).await? else {
            tracing::debug!("Login rejected for unknown user");
            return Err(AuthError::InvalidCredentials.into());
        };
        if !passwords::verify_password(password, &record.password_hash).await? {
            tracing::debug!(user_id = %record.user_id, "Login rejected for wrong password");
            return Err(AuthError::InvalidCredentials.into());
        }
        Ok(self.signer.issue(&record.user_id)?)
    }

    /// Verify a bearer token and return its user id.
    pub fn validate_token(&self, token: &str) -> Result<String, AuthError> {
        self.signer.validate(token)
    }
}
