//! Credentials shared by the HTTP transport and the realtime socket.
//!
//! - [`Credentials`]: access/refresh token pair, replaced only as a whole
//! - [`store::CredentialStore`]: the single holder of the current [`Credentials`], backed by a
//!   durable [`store::TokenStorage`]
//! - [`refresh::TokenRefresher`]: single-flight renewal of expired credentials

pub mod refresh;
pub mod store;

use chrono::{DateTime, TimeDelta, Utc};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

pub use refresh::TokenRefresher;
pub use store::{CredentialStore, Entry, FileStorage, MemoryStorage, TokenStorage};

/// Access/refresh token pair used to authenticate both the HTTP transport and the socket.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub(crate) access_token: SecretString,
    pub(crate) refresh_token: SecretString,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    #[must_use]
    pub fn new(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token: SecretString::from(access_token),
            refresh_token: SecretString::from(refresh_token),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns the access token.
    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    /// Returns the refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> &SecretString {
        &self.refresh_token
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Credentials without an expiry never expire locally; the server has the final say via 401.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub(crate) fn same_access_token(&self, other: &SecretString) -> bool {
        self.access_token.expose_secret() == other.expose_secret()
    }
}

/// Body returned by the renewal endpoint.
///
/// A missing `refresh_token` means the previous one stays valid.
#[derive(Debug, Deserialize)]
pub(crate) struct RenewedTokens {
    #[serde(alias = "accessToken", alias = "token")]
    pub(crate) access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub(crate) refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub(crate) expires_in: Option<i64>,
}

impl RenewedTokens {
    pub(crate) fn into_credentials(
        self,
        previous_refresh: &SecretString,
        now: DateTime<Utc>,
    ) -> Credentials {
        let refresh_token = self
            .refresh_token
            .map_or_else(|| previous_refresh.clone(), SecretString::from);

        Credentials {
            access_token: SecretString::from(self.access_token),
            refresh_token,
            expires_at: self
                .expires_in
                .and_then(TimeDelta::try_seconds)
                .map(|ttl| now + ttl),
        }
    }
}
