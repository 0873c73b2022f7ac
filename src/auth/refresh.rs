use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use reqwest::{Client as ReqwestClient, Method, StatusCode};
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::{Value, json};
use url::Url;

use super::store::CredentialStore;
use super::{Credentials, RenewedTokens};
use crate::error::Error;
use crate::{Result, serde_helpers};

/// Why a renewal failed. Cloned to every caller attached to the same renewal.
#[derive(Debug, Clone)]
struct RenewalFailure {
    reason: String,
}

impl RenewalFailure {
    fn new<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<RenewalFailure> for Error {
    fn from(failure: RenewalFailure) -> Self {
        Error::auth(failure.reason)
    }
}

type RenewalOutcome = std::result::Result<Arc<Credentials>, RenewalFailure>;
type Renewal = Shared<BoxFuture<'static, RenewalOutcome>>;

struct RefresherInner {
    client: ReqwestClient,
    endpoint: Url,
    store: CredentialStore,
    /// The renewal currently on the wire, if any. At most one exists at a time
    in_flight: Mutex<Option<Renewal>>,
    /// Renewal calls actually sent over the network
    renewals: AtomicU64,
}

/// Renews expired credentials against the refresh endpoint.
///
/// Concurrent callers are coalesced: while a renewal is in flight every further caller awaits
/// that same renewal instead of sending another request, and all of them observe the same
/// outcome. On success the new credentials are written to the [`CredentialStore`]; on failure
/// the store is cleared.
///
/// The renewal request carries no `Authorization` header and never passes through the
/// unauthorized-retry path, so it cannot recurse into itself.
#[derive(Clone)]
pub struct TokenRefresher {
    inner: Arc<RefresherInner>,
}

impl fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("renewals", &self.renewals())
            .finish_non_exhaustive()
    }
}

impl TokenRefresher {
    #[must_use]
    pub fn new(client: ReqwestClient, endpoint: Url, store: CredentialStore) -> Self {
        Self {
            inner: Arc::new(RefresherInner {
                client,
                endpoint,
                store,
                in_flight: Mutex::new(None),
                renewals: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Number of renewal requests sent so far.
    #[must_use]
    pub fn renewals(&self) -> u64 {
        self.inner.renewals.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Renew the credentials, joining a renewal that is already in flight.
    pub async fn refresh(&self) -> Result<Arc<Credentials>> {
        self.renewal(None).await.map_err(Error::from)
    }

    /// Renew the credentials because `rejected` was refused by the server (`None` when the call
    /// went out without a token).
    ///
    /// If the stored access token is no longer `rejected`, someone already renewed it and the
    /// current credentials are returned without touching the network.
    pub(crate) async fn refresh_rejected(
        &self,
        rejected: Option<&SecretString>,
    ) -> Result<Arc<Credentials>> {
        self.renewal(rejected).await.map_err(Error::from)
    }

    fn renewal(&self, rejected: Option<&SecretString>) -> Renewal {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(rejected) = rejected
            && let Some(current) = self.inner.store.get()
            && !current.same_access_token(rejected)
        {
            return futures::future::ready::<RenewalOutcome>(Ok(current))
                .boxed()
                .shared();
        }

        if let Some(renewal) = slot.as_ref() {
            #[cfg(feature = "tracing")]
            tracing::debug!("joining in-flight credential renewal");
            return renewal.clone();
        }

        let renewal = Self::renew(Arc::clone(&self.inner)).boxed().shared();
        *slot = Some(renewal.clone());
        renewal
    }

    async fn renew(inner: Arc<RefresherInner>) -> RenewalOutcome {
        let outcome = Self::exchange(&inner).await;

        match &outcome {
            Ok(credentials) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("credential renewal succeeded");
                // A persistence failure leaves the renewed credentials usable in memory
                _ = inner.store.set(Credentials::clone(credentials)).await;
            }
            Err(failure) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    reason = %failure.reason,
                    "credential renewal failed, clearing credentials"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = failure;
                _ = inner.store.clear().await;
            }
        }

        // Released only after the store holds the outcome, see `renewal`
        *inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        outcome
    }

    async fn exchange(inner: &RefresherInner) -> RenewalOutcome {
        let Some(current) = inner.store.get() else {
            return Err(RenewalFailure::new("no credentials to renew"));
        };

        inner.renewals.fetch_add(1, Ordering::SeqCst);

        let body = json!({ "refresh_token": current.refresh_token.expose_secret() });
        let response = inner
            .client
            .request(Method::POST, inner.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| RenewalFailure::new(format!("renewal request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let reason = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                format!("refresh token rejected ({status})")
            } else {
                format!("renewal endpoint answered {status}")
            };
            return Err(RenewalFailure::new(reason));
        }

        let value = response
            .json::<Value>()
            .await
            .map_err(|e| RenewalFailure::new(format!("unreadable renewal response: {e}")))?;
        let renewed: RenewedTokens = serde_helpers::deserialize_with_warnings(value)
            .map_err(|e| RenewalFailure::new(format!("malformed renewal response: {e}")))?;

        Ok(Arc::new(renewed.into_credentials(
            &current.refresh_token,
            Utc::now(),
        )))
    }
}
