use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{error::OAuthError, pkce};

/// The single scope this server grants.
pub const SCOPE: &str = "things:manage";

pub const AUTHORIZATION_CODE_TTL_SECS: i64 = 10 * 60;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 60 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Returns `n` random bytes encoded as unpadded base64url.
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A backend password. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret(s.to_string())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret(s)
    }
}

/// Masks the local part of an email address for logging.
pub fn mask_identity(identity: &str) -> String {
    match identity.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// A dynamically registered OAuth client (RFC 7591).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRequest {
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Option<Vec<String>>,
    #[serde(default)]
    pub response_types: Option<Vec<String>>,
}

/// Body of a successful `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
}

impl From<&Client> for RegistrationResponse {
    fn from(client: &Client) -> Self {
        Self {
            client_id: client.client_id.clone(),
            client_name: client.client_name.clone(),
            redirect_uris: client.redirect_uris.clone(),
            grant_types: client.grant_types.clone(),
            response_types: client.response_types.clone(),
        }
    }
}

/// A single-use authorization code, bound to the tenant that logged in.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub tenant_id: String,
    pub tenant_secret: Secret,
    pub code_challenge: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// What the token endpoint presents when redeeming a code.
#[derive(Debug, Clone)]
pub struct CodeRedemption {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_verifier: String,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Checks a redemption against this code, in the order the token endpoint
    /// reports failures. Does not mutate the code.
    pub fn check(&self, redemption: &CodeRedemption, now: DateTime<Utc>) -> Result<(), OAuthError> {
        if self.used {
            return Err(OAuthError::InvalidGrant(
                "authorization code already used".into(),
            ));
        }
        if self.is_expired(now) {
            return Err(OAuthError::InvalidGrant("authorization code expired".into()));
        }
        if self.client_id != redemption.client_id {
            return Err(OAuthError::InvalidGrant("client_id mismatch".into()));
        }
        if self.redirect_uri != redemption.redirect_uri {
            return Err(OAuthError::InvalidGrant("redirect_uri mismatch".into()));
        }
        if !pkce::verify(&redemption.code_verifier, &self.code_challenge) {
            return Err(OAuthError::InvalidGrant("PKCE verification failed".into()));
        }
        Ok(())
    }
}

/// A single-use refresh token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub tenant_id: String,
    pub tenant_secret: Secret,
    pub client_id: String,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn issue(tenant_id: &str, tenant_secret: &Secret, client_id: &str) -> Self {
        Self {
            token: random_token(32),
            tenant_id: tenant_id.to_string(),
            tenant_secret: tenant_secret.clone(),
            client_id: client_id.to_string(),
            expires_at: Utc::now() + Duration::seconds(REFRESH_TOKEN_TTL_SECS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Successful token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub scope: String,
}

/// RFC 9728 protected resource metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    pub fn for_base(base: &str) -> Self {
        Self {
            resource: base.to_string(),
            authorization_servers: vec![base.to_string()],
            scopes_supported: vec![SCOPE.to_string()],
            bearer_methods_supported: vec!["header".to_string()],
        }
    }
}

/// RFC 8414 authorization server metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: String,
    pub scopes_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    pub fn for_base(base: &str) -> Self {
        Self {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/token"),
            registration_endpoint: format!("{base}/register"),
            scopes_supported: vec![SCOPE.to_string()],
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "none".to_string(),
                "client_secret_basic".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
        }
    }
}
