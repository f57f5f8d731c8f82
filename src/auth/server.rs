//! The OAuth 2.1 state machine, independent of HTTP.
//!
//! [`OAuthServer`] owns the stores, the token codec and the account verifier.
//! The axum handlers in [`super::handlers`] only parse requests and render
//! responses; every decision about clients, codes and tokens is made here.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    bridge::CredentialBridge,
    error::OAuthError,
    pkce,
    store::{ClientRegistry, CredentialStore, GrantStore, MemoryStore},
    token::TokenCodec,
    types::{
        mask_identity, random_token, AuthorizationCode, Client, CodeRedemption, RefreshToken,
        RegistrationRequest, Secret, TokenResponse, ACCESS_TOKEN_TTL_SECS,
        AUTHORIZATION_CODE_TTL_SECS, SCOPE,
    },
};
use crate::{backend::AccountVerifier, error::Result, Error};

const DEFAULT_CLIENT_NAME: &str = "Unknown Client";

/// Query parameters of `/authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizeParams {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: Option<String>,
}

/// Form body of `POST /authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Form body of `POST /token`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_verifier: String,
    pub refresh_token: String,
}

/// Why an authorization request was not accepted. The message is shown to
/// the user in the login page.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeError {
    #[error("Unsupported response_type. Must be 'code'.")]
    UnsupportedResponseType,

    #[error("Missing required parameters: client_id, redirect_uri, state.")]
    MissingParameters,

    #[error("PKCE required: code_challenge and code_challenge_method=S256.")]
    PkceRequired,

    #[error("Unknown client_id.")]
    UnknownClient,

    #[error("Invalid redirect_uri.")]
    InvalidRedirectUri,

    #[error("Email and password are required.")]
    MissingCredentials,

    #[error("Invalid Things Cloud credentials.")]
    InvalidCredentials,

    #[error("Something went wrong. Please try again.")]
    Internal,
}

impl From<Error> for AuthorizeError {
    fn from(e: Error) -> Self {
        warn!("Authorization failed internally: {}", e);
        AuthorizeError::Internal
    }
}

pub struct OAuthServer {
    clients: Arc<dyn ClientRegistry>,
    grants: Arc<dyn GrantStore>,
    credentials: Arc<dyn CredentialStore>,
    codec: TokenCodec,
    verifier: Arc<dyn AccountVerifier>,
}

impl OAuthServer {
    /// Creates a server backed by a fresh [`MemoryStore`].
    pub fn new(codec: TokenCodec, verifier: Arc<dyn AccountVerifier>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            clients: store.clone(),
            grants: store.clone(),
            credentials: store,
            codec,
            verifier,
        }
    }

    /// Uses `store` for clients, grants and credentials.
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: ClientRegistry + GrantStore + CredentialStore + 'static,
    {
        self.clients = store.clone();
        self.grants = store.clone();
        self.credentials = store;
        self
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// A resolver for bearer tokens issued by this server.
    pub fn bridge(&self) -> CredentialBridge {
        CredentialBridge::new(self.codec.clone(), self.credentials.clone())
    }

    /// Dynamic client registration (RFC 7591).
    pub async fn register(&self, request: RegistrationRequest) -> std::result::Result<Client, OAuthError> {
        if request.redirect_uris.is_empty() {
            return Err(OAuthError::InvalidRequest("redirect_uris is required".into()));
        }
        if let Some(bad) = request
            .redirect_uris
            .iter()
            .find(|uri| Url::parse(uri).is_err())
        {
            return Err(OAuthError::InvalidRequest(format!(
                "invalid redirect_uri: {bad}"
            )));
        }

        let client = Client {
            client_id: random_token(24),
            client_secret: None,
            client_name: request
                .client_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            redirect_uris: request.redirect_uris,
            grant_types: request
                .grant_types
                .unwrap_or_else(|| vec!["authorization_code".to_string()]),
            response_types: request
                .response_types
                .unwrap_or_else(|| vec!["code".to_string()]),
            created_at: Utc::now(),
        };
        self.clients.insert_client(client.clone()).await?;

        info!(
            "Registered OAuth client {} ({})",
            client.client_name, client.client_id
        );
        Ok(client)
    }

    pub async fn client(&self, client_id: &str) -> Result<Option<Client>> {
        if client_id.is_empty() {
            return Ok(None);
        }
        self.clients.get_client(client_id).await
    }

    /// Checks an authorization request and returns the client it names.
    pub async fn validate_authorization(
        &self,
        params: &AuthorizeParams,
    ) -> std::result::Result<Client, AuthorizeError> {
        if params.response_type != "code" {
            return Err(AuthorizeError::UnsupportedResponseType);
        }
        if params.client_id.is_empty() || params.redirect_uri.is_empty() || params.state.is_empty()
        {
            return Err(AuthorizeError::MissingParameters);
        }
        if params.code_challenge.is_empty() || params.code_challenge_method != pkce::METHOD_S256 {
            return Err(AuthorizeError::PkceRequired);
        }

        let client = self
            .clients
            .get_client(&params.client_id)
            .await?
            .ok_or(AuthorizeError::UnknownClient)?;
        if !client.allows_redirect(&params.redirect_uri) {
            return Err(AuthorizeError::InvalidRedirectUri);
        }
        Ok(client)
    }

    /// Handles a submitted login form. On success returns the URL to send the
    /// user agent to, carrying the new authorization code and the client's
    /// `state`.
    pub async fn complete_login(
        &self,
        params: &AuthorizeParams,
        form: LoginForm,
    ) -> std::result::Result<Url, AuthorizeError> {
        let client = self.validate_authorization(params).await?;

        if form.email.is_empty() || form.password.is_empty() {
            return Err(AuthorizeError::MissingCredentials);
        }

        let secret = Secret::new(form.password);
        if let Err(e) = self.verifier.verify(&form.email, &secret).await {
            match e {
                Error::InvalidCredentials => {
                    debug!("Login rejected for {}", mask_identity(&form.email))
                }
                other => warn!(
                    "Account verification failed for {}: {}",
                    mask_identity(&form.email),
                    other
                ),
            }
            return Err(AuthorizeError::InvalidCredentials);
        }

        let mut location =
            Url::parse(&params.redirect_uri).map_err(|_| AuthorizeError::InvalidRedirectUri)?;

        let code = AuthorizationCode {
            code: random_token(32),
            client_id: client.client_id.clone(),
            redirect_uri: params.redirect_uri.clone(),
            tenant_id: form.email.clone(),
            tenant_secret: secret.clone(),
            code_challenge: params.code_challenge.clone(),
            expires_at: Utc::now() + Duration::seconds(AUTHORIZATION_CODE_TTL_SECS),
            used: false,
        };
        location
            .query_pairs_mut()
            .append_pair("code", &code.code)
            .append_pair("state", &params.state);

        self.grants.put_code(code).await?;
        self.credentials.put_credential(&form.email, secret).await?;

        info!(
            "Authorization code issued for {} (client={})",
            mask_identity(&form.email),
            client.client_id
        );
        Ok(location)
    }

    /// The token endpoint. `issuer` becomes the `iss` claim.
    pub async fn token(
        &self,
        request: &TokenRequest,
        issuer: &str,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        match request.grant_type.as_str() {
            "authorization_code" => self.exchange_code(request, issuer).await,
            "refresh_token" => self.refresh(request, issuer).await,
            _ => Err(OAuthError::UnsupportedGrantType(
                "grant_type must be authorization_code or refresh_token".into(),
            )),
        }
    }

    pub async fn exchange_code(
        &self,
        request: &TokenRequest,
        issuer: &str,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        if request.code.is_empty()
            || request.client_id.is_empty()
            || request.redirect_uri.is_empty()
            || request.code_verifier.is_empty()
        {
            return Err(OAuthError::InvalidRequest(
                "missing required parameters: code, client_id, redirect_uri, code_verifier".into(),
            ));
        }

        let redemption = CodeRedemption {
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            code_verifier: request.code_verifier.clone(),
        };
        let code = self
            .grants
            .redeem_code(&request.code, &redemption)
            .await
            .inspect_err(|e| debug!("Code exchange rejected: {}", e.description()))?;

        self.credentials
            .put_credential(&code.tenant_id, code.tenant_secret.clone())
            .await?;
        let response = self
            .issue_tokens(&code.tenant_id, &code.tenant_secret, &code.client_id, issuer)
            .await?;

        info!(
            "Tokens issued for {} (client={})",
            mask_identity(&code.tenant_id),
            code.client_id
        );
        Ok(response)
    }

    pub async fn refresh(
        &self,
        request: &TokenRequest,
        issuer: &str,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        if request.refresh_token.is_empty() {
            return Err(OAuthError::InvalidRequest("missing refresh_token".into()));
        }

        let old = self
            .grants
            .take_refresh_token(&request.refresh_token)
            .await
            .inspect_err(|e| debug!("Refresh rejected: {}", e.description()))?;

        self.credentials
            .put_credential(&old.tenant_id, old.tenant_secret.clone())
            .await?;
        let response = self
            .issue_tokens(&old.tenant_id, &old.tenant_secret, &old.client_id, issuer)
            .await?;

        info!("Tokens refreshed for {}", mask_identity(&old.tenant_id));
        Ok(response)
    }

    /// Removes expired grants; used by the background sweeper.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.grants.purge_expired(Utc::now()).await
    }

    async fn issue_tokens(
        &self,
        tenant_id: &str,
        secret: &Secret,
        client_id: &str,
        issuer: &str,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let access_token = self
            .codec
            .issue_access_token(tenant_id, issuer)
            .map_err(|e| {
                warn!("Access token signing failed: {}", e);
                OAuthError::ServerError("failed to create access token".into())
            })?;

        let refresh = RefreshToken::issue(tenant_id, secret, client_id);
        let refresh_token = refresh.token.clone();
        self.grants.put_refresh_token(refresh).await?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: ACCESS_TOKEN_TTL_SECS,
            refresh_token,
            scope: SCOPE.to_string(),
        })
    }
}

impl std::fmt::Debug for OAuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthServer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeVerifier;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
    const ISSUER: &str = "http://localhost:8080";

    fn server() -> OAuthServer {
        let codec = TokenCodec::new(b"server-test-secret").unwrap();
        let verifier = FakeVerifier::new().with_account("user@example.com", "hunter2");
        OAuthServer::new(codec, Arc::new(verifier))
    }

    async fn registered(server: &OAuthServer) -> Client {
        server
            .register(RegistrationRequest {
                client_name: Some("Test App".into()),
                redirect_uris: vec!["https://app/cb".into()],
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn params(client: &Client) -> AuthorizeParams {
        AuthorizeParams {
            response_type: "code".into(),
            client_id: client.client_id.clone(),
            redirect_uri: "https://app/cb".into(),
            state: "xyz".into(),
            code_challenge: CHALLENGE.into(),
            code_challenge_method: "S256".into(),
            scope: None,
        }
    }

    fn login() -> LoginForm {
        LoginForm {
            email: "user@example.com".into(),
            password: "hunter2".into(),
        }
    }

    fn code_of(location: &Url) -> String {
        location
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    fn exchange(client: &Client, code: &str, verifier: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".into(),
            code: code.into(),
            client_id: client.client_id.clone(),
            redirect_uri: "https://app/cb".into(),
            code_verifier: verifier.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_defaults() {
        let server = server();
        let client = server
            .register(RegistrationRequest {
                redirect_uris: vec!["https://app/cb".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(client.client_name, "Unknown Client");
        assert_eq!(client.grant_types, vec!["authorization_code"]);
        assert_eq!(client.response_types, vec!["code"]);
        assert_eq!(client.client_id.len(), 32);
        assert!(server.client(&client.client_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_requires_redirect_uris() {
        let err = server()
            .register(RegistrationRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn test_validate_authorization_errors() {
        let server = server();
        let client = registered(&server).await;

        let mut p = params(&client);
        p.response_type = "token".into();
        assert_eq!(
            server.validate_authorization(&p).await.unwrap_err(),
            AuthorizeError::UnsupportedResponseType
        );

        let mut p = params(&client);
        p.state.clear();
        assert_eq!(
            server.validate_authorization(&p).await.unwrap_err(),
            AuthorizeError::MissingParameters
        );

        let mut p = params(&client);
        p.code_challenge_method = "plain".into();
        assert_eq!(
            server.validate_authorization(&p).await.unwrap_err(),
            AuthorizeError::PkceRequired
        );

        let mut p = params(&client);
        p.client_id = "nope".into();
        assert_eq!(
            server.validate_authorization(&p).await.unwrap_err(),
            AuthorizeError::UnknownClient
        );

        let mut p = params(&client);
        p.redirect_uri = "https://evil/cb".into();
        assert_eq!(
            server.validate_authorization(&p).await.unwrap_err(),
            AuthorizeError::InvalidRedirectUri
        );

        assert!(server.validate_authorization(&params(&client)).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_errors() {
        let server = server();
        let client = registered(&server).await;

        let err = server
            .complete_login(&params(&client), LoginForm::default())
            .await
            .unwrap_err();
        assert_eq!(err, AuthorizeError::MissingCredentials);
        assert_eq!(err.to_string(), "Email and password are required.");

        let mut form = login();
        form.password = "wrong".into();
        assert_eq!(
            server
                .complete_login(&params(&client), form)
                .await
                .unwrap_err(),
            AuthorizeError::InvalidCredentials
        );

        // A tampered request is refused before credentials are checked.
        let mut p = params(&client);
        p.redirect_uri = "https://evil/cb".into();
        assert_eq!(
            server.complete_login(&p, login()).await.unwrap_err(),
            AuthorizeError::InvalidRedirectUri
        );
    }

    #[tokio::test]
    async fn test_code_exchanges_exactly_once() {
        let server = server();
        let client = registered(&server).await;
        let location = server
            .complete_login(&params(&client), login())
            .await
            .unwrap();
        assert_eq!(location.host_str(), Some("app"));
        assert!(location.query_pairs().any(|(k, v)| k == "state" && v == "xyz"));

        let code = code_of(&location);
        let tokens = server
            .token(&exchange(&client, &code, VERIFIER), ISSUER)
            .await
            .unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, 3600);
        assert_eq!(tokens.scope, "things:manage");

        let (tenant, secret) = server
            .bridge()
            .resolve_bearer(&tokens.access_token)
            .await
            .unwrap();
        assert_eq!(tenant, "user@example.com");
        assert_eq!(secret.expose(), "hunter2");

        let replay = server
            .token(&exchange(&client, &code, VERIFIER), ISSUER)
            .await
            .unwrap_err();
        assert_eq!(replay.code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_wrong_verifier_does_not_burn_code() {
        let server = server();
        let client = registered(&server).await;
        let location = server
            .complete_login(&params(&client), login())
            .await
            .unwrap();
        let code = code_of(&location);

        let err = server
            .token(&exchange(&client, &code, "wrong-verifier"), ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
        assert_eq!(err.description(), "PKCE verification failed");

        assert!(server
            .token(&exchange(&client, &code, VERIFIER), ISSUER)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rotation() {
        let server = server();
        let client = registered(&server).await;
        let location = server
            .complete_login(&params(&client), login())
            .await
            .unwrap();
        let first = server
            .token(&exchange(&client, &code_of(&location), VERIFIER), ISSUER)
            .await
            .unwrap();

        let refresh = |token: &str| TokenRequest {
            grant_type: "refresh_token".into(),
            refresh_token: token.into(),
            ..Default::default()
        };

        let second = server
            .token(&refresh(&first.refresh_token), ISSUER)
            .await
            .unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let err = server
            .token(&refresh(&first.refresh_token), ISSUER)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_grant");

        assert!(server
            .token(&refresh(&second.refresh_token), ISSUER)
            .await
            .is_ok());
        assert!(server
            .token(&refresh(&second.refresh_token), ISSUER)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_token_request_validation() {
        let server = server();

        let err = server
            .token(
                &TokenRequest {
                    grant_type: "password".into(),
                    ..Default::default()
                },
                ISSUER,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_grant_type");

        let err = server
            .token(
                &TokenRequest {
                    grant_type: "authorization_code".into(),
                    code: "abc".into(),
                    ..Default::default()
                },
                ISSUER,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let err = server
            .token(
                &TokenRequest {
                    grant_type: "refresh_token".into(),
                    ..Default::default()
                },
                ISSUER,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }
}
