//! Username/password credentials exchanged for short-lived bearer tokens against the
//! identity service. One `Credentials` value is shared by every download worker.
use parking_lot::{Mutex, RwLock};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{AuthSettings, Settings};
use crate::error::{Error, Result};
use crate::netrc::Netrc;
use crate::retry::{with_retry, RetryPolicy};

#[derive(Clone)]
struct Token {
    access: String,
    expires_at: Instant,
    refresh: Option<String>,
    refresh_expires_at: Instant,
}

impl Token {
    fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }

    fn refresh_token(&self, margin: Duration) -> Option<&str> {
        if Instant::now() + margin < self.refresh_expires_at {
            self.refresh.as_deref()
        } else {
            None
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
    refresh_expires_in: Option<u64>,
}

pub struct Credentials {
    username: String,
    password: String,
    auth: AuthSettings,
    retry: RetryPolicy,
    client: Client,
    token: RwLock<Option<Token>>,
    refresh_lock: Mutex<()>,
    exchanges: AtomicUsize,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"*".repeat(self.password.len()))
            .field("token_url", &self.auth.token_url.as_str())
            .finish()
    }
}

impl Credentials {
    pub fn new(username: &str, password: &str, settings: &Settings) -> Result<Self> {
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            auth: settings.auth.clone(),
            retry: settings.retry,
            client: settings.http.api_client()?,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            exchanges: AtomicUsize::new(0),
        })
    }

    /// Uses the explicit username/password when both are given, otherwise looks the
    /// identity host up in the login file. Never touches the network.
    pub fn resolve(
        username: Option<&str>,
        password: Option<&str>,
        settings: &Settings,
    ) -> Result<Self> {
        if let (Some(username), Some(password)) = (username, password) {
            return Self::new(username, password, settings);
        }

        let host = settings
            .auth
            .token_url
            .host_str()
            .unwrap_or_default()
            .to_string();
        let netrc = match settings.auth.netrc_path() {
            Some(path) if path.exists() => Netrc::read(&path)?,
            _ => return Err(Error::CredentialsMissing(host)),
        };
        let login = netrc
            .authenticator(&host)
            .ok_or_else(|| Error::CredentialsMissing(host.clone()))?;
        debug!("Using credentials for {} from login file", host);
        Self::new(&login.login, &login.password, settings)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Number of token exchanges performed so far.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Returns a bearer token that stays valid for at least the configured margin,
    /// exchanging credentials when the cached one is missing or about to expire.
    pub fn token(&self) -> Result<String> {
        let margin = self.auth.expiry_margin();
        if let Some(token) = self.token.read().as_ref() {
            if token.is_fresh(margin) {
                return Ok(token.access.clone());
            }
        }

        let _guard = self.refresh_lock.lock();
        // Another worker may have refreshed while we waited for the lock
        let current = self.token.read().clone();
        if let Some(token) = &current {
            if token.is_fresh(margin) {
                return Ok(token.access.clone());
            }
        }
        self.refresh(current.as_ref())
    }

    /// Replaces a token the server rejected. Concurrent callers holding the same
    /// rejected token share one exchange.
    pub fn refresh_rejected(&self, rejected: &str) -> Result<String> {
        let margin = self.auth.expiry_margin();
        let _guard = self.refresh_lock.lock();
        let current = self.token.read().clone();
        if let Some(token) = &current {
            if token.access != rejected && token.is_fresh(margin) {
                return Ok(token.access.clone());
            }
        }
        self.refresh(current.as_ref())
    }

    // Callers must hold `refresh_lock`.
    fn refresh(&self, current: Option<&Token>) -> Result<String> {
        let margin = self.auth.expiry_margin();
        let token = match current.and_then(|t| t.refresh_token(margin)) {
            Some(refresh) => match self
                .exchange(&[("grant_type", "refresh_token"), ("refresh_token", refresh)])
            {
                Err(Error::AuthenticationFailed(reason)) => {
                    debug!("Refresh token rejected ({}), falling back to password", reason);
                    self.password_exchange()?
                }
                other => other?,
            },
            None => self.password_exchange()?,
        };
        let access = token.access.clone();
        *self.token.write() = Some(token);
        Ok(access)
    }

    fn password_exchange(&self) -> Result<Token> {
        self.exchange(&[
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ])
    }

    fn exchange(&self, grant: &[(&str, &str)]) -> Result<Token> {
        let mut form = grant.to_vec();
        form.push(("client_id", self.auth.client_id.as_str()));

        let token = with_retry(&self.retry, "Token exchange", || {
            let response = self
                .client
                .post(self.auth.token_url.clone())
                .form(&form)
                .send()
                .map_err(Error::from_transport)?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(Error::TransientNetwork(format!(
                    "Token endpoint returned {}",
                    status
                )));
            }
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(Error::AuthenticationFailed(format!(
                    "Unable to exchange token for {} ({}): {}",
                    self.username, status, body
                )));
            }

            let payload: TokenResponse = response.json().map_err(|e| {
                Error::AuthenticationFailed(format!("Malformed token payload: {}", e))
            })?;
            Ok(payload)
        })?;

        let count = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Obtained access token for {} (exchange #{})", self.username, count);

        let now = Instant::now();
        let expiry = |seconds: u64| {
            now.checked_add(Duration::from_secs(seconds)).ok_or_else(|| {
                Error::AuthenticationFailed(
                    "Malformed token payload: expiry out of range".to_string(),
                )
            })
        };
        let expires_at = expiry(token.expires_in)?;
        let refresh_expires_at = expiry(token.refresh_expires_in.unwrap_or(0))?;
        Ok(Token {
            access: token.access_token,
            expires_at,
            refresh: token.refresh_token,
            refresh_expires_at,
        })
    }
}

/// Checks whether a username/password pair (or the login file, when either is absent)
/// is accepted by the identity service. Only network failures are returned as errors.
pub fn validate_credentials(
    username: Option<&str>,
    password: Option<&str>,
    settings: &Settings,
) -> Result<bool> {
    let credentials = match Credentials::resolve(username, password, settings) {
        Ok(credentials) => credentials,
        Err(Error::CredentialsMissing(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    match credentials.token() {
        Ok(_) => Ok(true),
        Err(Error::AuthenticationFailed(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
