//! Credential verification behind the [`Authenticator`] seam.

use std::collections::HashMap;

use futures::future::BoxFuture;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use password_hash::{PasswordHash, PasswordVerifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use utoipa::ToSchema;

use crate::config::Account;

/// Who a connection logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    pub email: String,
    pub display_name: String,
}

/// Material presented by a client to prove its identity.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Signed session token obtained from the HTTP API.
    Token(String),
    /// Email and password typed into the login form.
    Password { email: String, password: String },
}

/// Reasons a credential is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Verifies credentials on behalf of the hub.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: Credential) -> BoxFuture<'static, Result<Identity, AuthError>>;
}

/// Claims carried by relay session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

/// HS256 token verification plus password checks against configured accounts.
pub struct ConfigAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    accounts: HashMap<String, Account>,
}

impl ConfigAuthenticator {
    pub fn new(secret: &[u8], accounts: Vec<Account>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            accounts: accounts
                .into_iter()
                .map(|account| (account.email.to_lowercase(), account))
                .collect(),
        }
    }

    fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })?;
        let claims = data.claims;
        let display_name = claims
            .name
            .or_else(|| {
                self.accounts
                    .get(&claims.email.to_lowercase())
                    .map(|account| account.display_name.clone())
            })
            .unwrap_or_else(|| claims.email.clone());
        Ok(Identity {
            email: claims.email,
            display_name,
        })
    }

    fn verify_password(&self, email: &str, password: &str) -> Result<Identity, AuthError> {
        let account = self
            .accounts
            .get(&email.to_lowercase())
            .ok_or(AuthError::InvalidCredentials)?;
        let parsed = PasswordHash::new(&account.password_hash).map_err(|err| {
            warn!(email = %account.email, error = %err, "account has an unreadable password hash");
            AuthError::InvalidCredentials
        })?;
        argon2::Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::InvalidCredentials)?;
        Ok(Identity {
            email: account.email.clone(),
            display_name: account.display_name.clone(),
        })
    }
}

impl Authenticator for ConfigAuthenticator {
    fn authenticate(&self, credential: Credential) -> BoxFuture<'static, Result<Identity, AuthError>> {
        let result = match credential {
            Credential::Token(token) => self.verify_token(&token),
            Credential::Password { email, password } => self.verify_password(&email, &password),
        };
        Box::pin(async move { result })
    }
}
