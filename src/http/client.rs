use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bon::Builder;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, Request, StatusCode};
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use url::Url;

use crate::auth::{CredentialStore, TokenRefresher};
use crate::error::{Error, Kind};
use crate::policy::{self, Action, Attempt, Failure};
use crate::{Result, ToQueryParams as _, serde_helpers};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REFRESH_PATH: &str = "auth/refresh";
const DEFAULT_CACHE_BUSTER_PARAM: &str = "_t";
const DEFAULT_USER_AGENT: &str = "console_transport";
const NOTIFICATION_CAPACITY: usize = 64;

/// Configuration for [`Client`]
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Upper bound for a whole call, from connect to the last body byte. Expiry is reported as
    /// [`Kind::Network`] and is never retried.
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
    /// Path of the credential renewal endpoint, relative to the host.
    #[builder(into, default = DEFAULT_REFRESH_PATH.to_owned())]
    refresh_path: String,
    /// Query parameter appended to every GET so intermediaries never serve a cached body.
    #[builder(into, default = DEFAULT_CACHE_BUSTER_PARAM.to_owned())]
    cache_buster_param: String,
    #[builder(into, default = DEFAULT_USER_AGENT.to_owned())]
    user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// User-facing signal emitted by the transport. Delivery is fire-and-forget: nothing waits for a
/// receiver, and with no receiver the signal is dropped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A successful response carried a `message` for the user
    Success(String),
    /// A call failed in a way the user should hear about
    Failure { kind: Kind, message: String },
    /// Credentials are gone; route the user to the login boundary
    SessionExpired,
}

/// Per-call options for [`Client::request`].
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    query: String,
    body: Option<Value>,
    headers: HeaderMap,
    skip_auth: bool,
    invalid: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the fields of `query` as URL query parameters.
    #[must_use]
    pub fn query<Q: Serialize>(mut self, query: &Q) -> Self {
        let encoded = query.query_string();
        if !encoded.is_empty() {
            if !self.query.is_empty() {
                self.query.push('&');
            }
            self.query.push_str(&encoded);
        }
        self
    }

    /// Send `body` as JSON.
    #[must_use]
    pub fn json<B: Serialize>(mut self, body: &B) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => self.body = Some(value),
            Err(e) => self.invalid = Some(format!("unserializable request body: {e}")),
        }
        self
    }

    /// Add a header to this call. Names are case-insensitive; an invalid name or value makes
    /// the call fail with a validation error instead of being sent.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let header_name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.invalid = Some(format!("invalid header name {name:?}: {e}"));
                return self;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(header_name, value);
            }
            Err(e) => self.invalid = Some(format!("invalid value for header {name}: {e}")),
        }
        self
    }

    /// Send without credentials and without the unauthorized-renew-retry path.
    #[must_use]
    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Result of one exchange with the server.
enum Exchange {
    Success(Value),
    Rejected { status: StatusCode, message: String },
}

/// Authenticated HTTP transport.
///
/// Every call carries `Authorization: Bearer <access token>` read from the
/// [`CredentialStore`] at send time. When the server answers `401 Unauthorized` the credentials
/// are renewed through the shared [`TokenRefresher`] and the original call is re-issued exactly
/// once; callers only ever see the final outcome.
///
/// [`Client`] is cheap to clone and thread-safe.
///
/// ```rust,no_run
/// use console_transport::auth::{CredentialStore, Credentials};
/// use console_transport::http::{Client, Config, RequestOptions};
/// use reqwest::Method;
/// use serde_json::Value;
///
/// # async fn example() -> console_transport::Result<()> {
/// let store = CredentialStore::default();
/// store
///     .set(Credentials::new("access".to_owned(), "refresh".to_owned()))
///     .await?;
///
/// let client = Client::new("https://console.example.com/api/", Config::default(), store)?;
/// let users: Value = client
///     .request(Method::GET, "users", RequestOptions::new().query(&[("page", 2)]))
///     .await?;
/// println!("{users}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: Config,
    /// Base [`Url`]; always ends with `/` so relative paths join beneath it
    host: Url,
    client: ReqwestClient,
    credentials: CredentialStore,
    refresher: TokenRefresher,
    notifications: broadcast::Sender<Notification>,
    /// Last cache-busting value handed out
    cache_buster: AtomicI64,
}

impl Client {
    /// Creates a new transport against `host`, authenticating with `credentials`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host URL is invalid or the HTTP client cannot be initialized.
    pub fn new(host: &str, config: Config, credentials: CredentialStore) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", HeaderValue::from_str(&config.user_agent)?);
        headers.insert("Accept", HeaderValue::from_static("application/json"));

        let client = ReqwestClient::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let mut host = Url::parse(host)?;
        if !host.path().ends_with('/') {
            let path = format!("{}/", host.path());
            host.set_path(&path);
        }

        let refresh_endpoint = host.join(config.refresh_path.trim_start_matches('/'))?;
        let refresher = TokenRefresher::new(client.clone(), refresh_endpoint, credentials.clone());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                host,
                client,
                credentials,
                refresher,
                notifications,
                cache_buster: AtomicI64::new(0),
            }),
        })
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.inner.host
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    #[must_use]
    pub fn refresher(&self) -> &TokenRefresher {
        &self.inner.refresher
    }

    /// Subscribe to user-facing notifications.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Forget the current credentials.
    pub async fn logout(&self) -> Result<()> {
        self.inner.credentials.clear().await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::GET, path, options).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::POST, path, options).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, options: RequestOptions) -> Result<T> {
        self.request(Method::PUT, path, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.request(Method::DELETE, path, options).await
    }

    /// Issue `method path` and decode the JSON response into `T`.
    ///
    /// An empty body decodes from `null` (so `()` and `Option<_>` work) and a non-JSON body
    /// decodes from a JSON string.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let value = self.send(method, path, &options).await?;
        serde_helpers::deserialize_with_warnings(value)
    }

    async fn send(&self, method: Method, path: &str, options: &RequestOptions) -> Result<Value> {
        if let Some(reason) = &options.invalid {
            return Err(Error::validation(reason.clone()));
        }

        let url = self.url(&method, path, options)?;
        let mut attempt = Attempt::first(options.skip_auth);

        loop {
            let token = if attempt.skip_auth {
                None
            } else {
                self.inner.credentials.access_token()
            };
            let request = self.build(&method, &url, options, token.as_ref())?;

            let (failure, error) = match execute(&self.inner.client, request).await {
                Ok(Exchange::Success(value)) => {
                    if let Some(message) = serde_helpers::message_of(&value) {
                        self.notify(Notification::Success(message.to_owned()));
                    }
                    return Ok(value);
                }
                Ok(Exchange::Rejected { status, message }) => (
                    Failure::Status(status),
                    Error::status(status, method.clone(), url.path().to_owned(), message),
                ),
                Err(e) if e.kind() == Kind::Network => (Failure::NoResponse, e),
                Err(e) => return Err(e),
            };

            match policy::decide(failure, attempt) {
                Action::RefreshAndRetry => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%method, path = url.path(), "unauthorized, renewing credentials");

                    if let Err(e) = self.inner.refresher.refresh_rejected(token.as_ref()).await {
                        self.notify(Notification::SessionExpired);
                        return Err(e);
                    }
                    attempt = attempt.retry();
                }
                Action::ExpireSession => {
                    _ = self.inner.credentials.clear().await;
                    self.notify(Notification::SessionExpired);
                    return Err(Error::auth(
                        "request still unauthorized after renewing credentials",
                    ));
                }
                Action::Surface { kind, silent } => {
                    if !silent {
                        self.notify(Notification::Failure {
                            kind,
                            message: user_message(&failure, &error),
                        });
                    }
                    return Err(error);
                }
            }
        }
    }

    fn url(&self, method: &Method, path: &str, options: &RequestOptions) -> Result<Url> {
        let mut url = self.inner.host.join(path.trim_start_matches('/'))?;

        if !options.query.is_empty() {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{}", options.query),
                _ => options.query.clone(),
            };
            url.set_query(Some(&query));
        }

        if *method == Method::GET {
            let stamp = self.next_cache_buster();
            url.query_pairs_mut()
                .append_pair(&self.inner.config.cache_buster_param, &stamp.to_string());
        }

        Ok(url)
    }

    fn build(
        &self,
        method: &Method,
        url: &Url,
        options: &RequestOptions,
        token: Option<&SecretString>,
    ) -> Result<Request> {
        let mut builder = self
            .inner
            .client
            .request(method.clone(), url.clone())
            .headers(options.headers.clone());

        if let Some(token) = token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        Ok(builder.build()?)
    }

    /// Strictly increasing millisecond timestamp, even for calls within the same millisecond.
    fn next_cache_buster(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .inner
            .cache_buster
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    fn notify(&self, notification: Notification) {
        // No receiver is fine
        _ = self.inner.notifications.send(notification);
    }
}

fn user_message(failure: &Failure, error: &Error) -> String {
    match (failure, error.downcast_ref::<crate::error::Status>()) {
        (Failure::Status(_), Some(status)) if !status.message.is_empty() => status.message.clone(),
        (Failure::Status(status), _) => format!("request failed ({status})"),
        (Failure::NoResponse, _) => "network error, please check your connection".to_owned(),
    }
}

#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(client, request),
        fields(
            method = %request.method(),
            path = request.url().path(),
            status_code
        )
    )
)]
async fn execute(client: &ReqwestClient, request: Request) -> Result<Exchange> {
    let response = client.execute(request).await?;
    let status_code = response.status();

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    // A transfer cut short after the status line is still a lost response
    let text = response
        .text()
        .await
        .map_err(|e| Error::with_source(Kind::Network, e))?;

    if !status_code.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| serde_helpers::message_of(&value).map(str::to_owned))
            .unwrap_or(text);

        #[cfg(feature = "tracing")]
        tracing::warn!(status = %status_code, message = %message, "API request failed");

        return Ok(Exchange::Rejected {
            status: status_code,
            message,
        });
    }

    let value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };

    Ok(Exchange::Success(value))
}
