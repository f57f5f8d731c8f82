//! Test utilities for `things_mcp`.
//!
//! Fake backend collaborators with call counters, plus a helper that starts
//! the full HTTP server on an ephemeral port. Kept in the library so the
//! integration tests under `tests/` can share them via
//! `use things_mcp::testutils::*`.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::{
    auth::{challenge_for, OAuthServer, Secret, TokenCodec, TokenResponse},
    backend::{AccountInfo, AccountSession, AccountVerifier, SessionFactory},
    error::{Error, Result},
    tools::AccountTools,
    Server, ServerHandle,
};

pub const TEST_EMAIL: &str = "user@example.com";
pub const TEST_PASSWORD: &str = "hunter2";
pub const TEST_JWT_SECRET: &[u8] = b"things-mcp-test-secret";
pub const TEST_REDIRECT_URI: &str = "https://app/cb";
/// The RFC 7636 appendix B verifier.
pub const TEST_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn account_for(identity: &str) -> AccountInfo {
    AccountInfo {
        email: Some(identity.to_string()),
        status: Some("SYAccountStatusActive".to_string()),
        ..Default::default()
    }
}

/// An [`AccountVerifier`] backed by a fixed set of logins.
#[derive(Debug, Default)]
pub struct FakeVerifier {
    accounts: DashMap<String, String>,
    calls: AtomicUsize,
}

impl FakeVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, identity: &str, password: &str) -> Self {
        self.accounts
            .insert(identity.to_string(), password.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountVerifier for FakeVerifier {
    async fn verify(&self, identity: &str, secret: &Secret) -> Result<AccountInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.accounts.get(identity) {
            Some(password) if password.as_str() == secret.expose() => Ok(account_for(identity)),
            _ => Err(Error::InvalidCredentials),
        }
    }
}

/// The session built by [`FakeFactory`].
#[derive(Debug)]
pub struct FakeSession {
    pub identity: String,
    pub secret: String,
    pub account: AccountInfo,
    /// 1 for the first session the factory built, 2 for the second, ...
    pub serial: usize,
}

impl AccountSession for FakeSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn account(&self) -> &AccountInfo {
        &self.account
    }
}

/// A [`SessionFactory`] that counts constructions and can be told to fail or
/// to take its time.
///
/// With no accounts configured every login succeeds; once an account is
/// added, its password must match.
#[derive(Debug, Default)]
pub struct FakeFactory {
    accounts: DashMap<String, String>,
    rejected: DashSet<String>,
    delays: DashMap<String, Duration>,
    delay: Duration,
    attempts: AtomicUsize,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, identity: &str, password: &str) -> Self {
        self.accounts
            .insert(identity.to_string(), password.to_string());
        self
    }

    /// Every construction sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Constructions for `identity` sleep for `delay` instead.
    pub fn delay_for(&self, identity: &str, delay: Duration) {
        self.delays.insert(identity.to_string(), delay);
    }

    pub fn reject(&self, identity: &str) {
        self.rejected.insert(identity.to_string());
    }

    pub fn accept(&self, identity: &str) {
        self.rejected.remove(identity);
    }

    /// Constructions started, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Constructions that succeeded.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self, identity: &str, secret: &Secret) -> Result<FakeSession> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = self
            .delays
            .get(identity)
            .map(|d| *d.value())
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.rejected.contains(identity) {
            return Err(Error::InvalidCredentials);
        }
        if !self.accounts.is_empty() {
            match self.accounts.get(identity) {
                Some(password) if password.as_str() == secret.expose() => {}
                _ => return Err(Error::InvalidCredentials),
            }
        }

        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeSession {
            identity: identity.to_string(),
            secret: secret.expose().to_string(),
            account: account_for(identity),
            serial,
        })
    }
}

/// A running server wired to fakes.
pub struct TestServer {
    pub handle: ServerHandle,
    pub url: String,
    pub verifier: Arc<FakeVerifier>,
    pub factory: Arc<FakeFactory>,
}

impl TestServer {
    pub async fn stop(self) -> Result<()> {
        self.handle.stop().await
    }
}

/// Starts a server on `127.0.0.1:0` that accepts [`TEST_EMAIL`] /
/// [`TEST_PASSWORD`] and keeps its OAuth state in memory.
pub async fn spawn_test_server() -> Result<TestServer> {
    let verifier = Arc::new(FakeVerifier::new().with_account(TEST_EMAIL, TEST_PASSWORD));
    let oauth = OAuthServer::new(TokenCodec::new(TEST_JWT_SECRET)?, verifier.clone());
    spawn_with(oauth, verifier).await
}

/// Like [`spawn_test_server`], with a caller-built [`OAuthServer`] (for
/// example one using a file store). `verifier` is only kept for its counter.
pub async fn spawn_with(oauth: OAuthServer, verifier: Arc<FakeVerifier>) -> Result<TestServer> {
    let factory = Arc::new(FakeFactory::new().with_account(TEST_EMAIL, TEST_PASSWORD));
    let handle = Server::new(oauth, factory.clone(), AccountTools::new())
        .serve_http("127.0.0.1:0")
        .await?;
    let url = handle.url();
    Ok(TestServer {
        handle,
        url,
        verifier,
        factory,
    })
}

/// An HTTP client that does not follow redirects, so tests can read the
/// authorization redirect.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Registers a client for [`TEST_REDIRECT_URI`] and returns its id.
pub async fn register_client(http: &reqwest::Client, base: &str) -> Result<String> {
    let response = http
        .post(format!("{base}/register"))
        .json(&serde_json::json!({
            "client_name": "Test Client",
            "redirect_uris": [TEST_REDIRECT_URI],
        }))
        .send()
        .await?
        .error_for_status()?;
    let body: serde_json::Value = response.json().await?;
    body["client_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InternalError("registration returned no client_id".into()))
}

/// Logs in as [`TEST_EMAIL`] and returns the authorization code from the
/// redirect.
pub async fn authorize(http: &reqwest::Client, base: &str, client_id: &str) -> Result<String> {
    let mut url = url::Url::parse(&format!("{base}/authorize"))
        .map_err(|e| Error::InternalError(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", TEST_REDIRECT_URI)
        .append_pair("state", "xyz")
        .append_pair("code_challenge", &challenge_for(TEST_VERIFIER))
        .append_pair("code_challenge_method", "S256");

    let response = http
        .post(url)
        .form(&[("email", TEST_EMAIL), ("password", TEST_PASSWORD)])
        .send()
        .await?;
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::InternalError("login did not redirect".into()))?;
    let location =
        url::Url::parse(location).map_err(|e| Error::InternalError(e.to_string()))?;

    location
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::InternalError("redirect carried no code".into()))
}

/// Runs registration, login and code exchange, returning the issued tokens.
pub async fn obtain_tokens(http: &reqwest::Client, base: &str) -> Result<TokenResponse> {
    let client_id = register_client(http, base).await?;
    let code = authorize(http, base, &client_id).await?;
    let response = http
        .post(format!("{base}/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", client_id.as_str()),
            ("redirect_uri", TEST_REDIRECT_URI),
            ("code_verifier", TEST_VERIFIER),
        ])
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}
