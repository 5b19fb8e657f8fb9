use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use system::Username;
use thiserror::Error;

use crate::config::IdentityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,
    #[error("credential invalid")]
    Invalid,
    #[error("credential expired")]
    Expired,
}

/// Resolves the bearer credential of a connection attempt to a username.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Username, AuthError>;
}

struct TokenGrant {
    username: Username,
    expires_at: Option<DateTime<Utc>>,
}

/// Fixed table of tokens issued out of band.
pub struct StaticTokenVerifier {
    grants: HashMap<String, TokenGrant>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self {
            grants: HashMap::new(),
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        let mut verifier = Self::new();
        for entry in &config.tokens {
            verifier.grant(&entry.token, &entry.username, entry.expires_at);
        }
        verifier
    }

    pub fn grant(&mut self, token: &str, username: &str, expires_at: Option<DateTime<Utc>>) {
        self.grants.insert(
            token.to_owned(),
            TokenGrant {
                username: username.to_owned(),
                expires_at,
            },
        );
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Username, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        let grant = self.grants.get(credential).ok_or(AuthError::Invalid)?;
        match grant.expires_at {
            Some(expires_at) if expires_at <= Utc::now() => Err(AuthError::Expired),
            _ => Ok(grant.username.clone()),
        }
    }
}
