//! Backend collaborators.
//!
//! The authorization server only needs two things from the task backend:
//! a way to check a login ([`AccountVerifier`]) and a way to build the
//! per-tenant session object that tools run against ([`SessionFactory`]).
//! [`CloudClient`] provides both for Things Cloud.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{header, Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::{
    auth::{mask_identity, Secret},
    error::{Error, Result},
};

pub const DEFAULT_THINGS_ENDPOINT: &str = "https://cloud.culturedcode.com";

/// Account details returned by a successful verification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Checks a backend login.
#[async_trait]
pub trait AccountVerifier: Send + Sync {
    /// Returns the account on success and [`Error::InvalidCredentials`] when
    /// the backend rejects the login.
    async fn verify(&self, identity: &str, secret: &Secret) -> Result<AccountInfo>;
}

/// Builds the expensive per-tenant session object.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    async fn create(&self, identity: &str, secret: &Secret) -> Result<Self::Session>;
}

/// What a session can report about the account it is logged in as.
pub trait AccountSession: Send + Sync + 'static {
    fn identity(&self) -> &str;

    fn account(&self) -> &AccountInfo;
}

/// A verified Things Cloud login.
#[derive(Debug, Clone)]
pub struct CloudSession {
    pub identity: String,
    pub account: AccountInfo,
}

impl AccountSession for CloudSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn account(&self) -> &AccountInfo {
        &self.account
    }
}

/// Minimal Things Cloud HTTP client.
#[derive(Debug, Clone)]
pub struct CloudClient {
    endpoint: Url,
    http: HttpClient,
}

impl CloudClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            Error::InvalidConfiguration(format!("invalid Things endpoint {endpoint}: {e}"))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::InvalidConfiguration(format!(
                "Things endpoint {endpoint} cannot be used as a base URL"
            )));
        }
        let http = HttpClient::builder()
            .user_agent(concat!("things-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("HTTP client: {e}")))?;
        Ok(Self { endpoint, http })
    }

    fn account_url(&self, identity: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InternalError("endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(["version", "1", "account", identity]);
        Ok(url)
    }
}

#[async_trait]
impl AccountVerifier for CloudClient {
    async fn verify(&self, identity: &str, secret: &Secret) -> Result<AccountInfo> {
        let url = self.account_url(identity)?;
        debug!("Verifying Things Cloud account {}", mask_identity(identity));

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Password {}", secret.expose()))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<AccountInfo>().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(Error::InvalidCredentials)
            }
            status => Err(Error::Backend(format!(
                "account verification returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl SessionFactory for CloudClient {
    type Session = CloudSession;

    async fn create(&self, identity: &str, secret: &Secret) -> Result<CloudSession> {
        let account = self.verify(identity, secret).await?;
        info!("Things Cloud session ready for {}", mask_identity(identity));
        Ok(CloudSession {
            identity: identity.to_string(),
            account,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_url_escapes_identity() {
        let client = CloudClient::new("https://cloud.example.com").unwrap();
        let url = client.account_url("jane doe@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cloud.example.com/version/1/account/jane%20doe@example.com"
        );
    }

    #[test]
    fn test_account_url_keeps_endpoint_path() {
        let client = CloudClient::new("http://127.0.0.1:9000/things/").unwrap();
        let url = client.account_url("a@b.c").unwrap();
        assert_eq!(url.path(), "/things/version/1/account/a@b.c");
    }

    #[test]
    fn test_rejects_invalid_endpoint() {
        assert!(matches!(
            CloudClient::new("not a url"),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_account_info_keeps_unknown_fields() {
        let info: AccountInfo = serde_json::from_str(
            r#"{"email":"jane@example.com","status":"SYAccountStatusActive","history-key":"abc"}"#,
        )
        .unwrap();
        assert_eq!(info.email.as_deref(), Some("jane@example.com"));
        assert_eq!(info.extra["history-key"], "abc");
    }
}
