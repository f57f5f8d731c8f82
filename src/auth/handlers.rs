//! HTTP surface of the authorization server.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection, QueryRejection},
        Query, RawQuery, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{
    error::OAuthError,
    pages::login_page,
    server::{AuthorizeError, AuthorizeParams, LoginForm, OAuthServer, TokenRequest},
    types::{
        AuthorizationServerMetadata, ProtectedResourceMetadata, RegistrationRequest,
        RegistrationResponse,
    },
};

pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
pub const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

#[derive(Clone)]
struct AuthState {
    server: Arc<OAuthServer>,
    public_url: Option<Arc<str>>,
}

impl AuthState {
    fn base_url(&self, headers: &HeaderMap) -> String {
        base_url(headers, self.public_url.as_deref())
    }
}

/// Routes for discovery, registration, authorization and token issuance.
pub fn routes(server: Arc<OAuthServer>, public_url: Option<String>) -> Router {
    let state = AuthState {
        server,
        public_url: public_url.map(Arc::from),
    };

    Router::new()
        .route(PROTECTED_RESOURCE_PATH, get(protected_resource))
        .route(
            &format!("{PROTECTED_RESOURCE_PATH}/mcp"),
            get(protected_resource),
        )
        .route(AUTHORIZATION_SERVER_PATH, get(authorization_server))
        .route(
            &format!("{AUTHORIZATION_SERVER_PATH}/mcp"),
            get(authorization_server),
        )
        .route("/register", post(register))
        .route("/authorize", get(authorize_form).post(authorize_submit))
        .route("/token", post(token))
        .with_state(state)
}

/// The externally visible origin of this server.
///
/// A configured public URL wins. Otherwise the scheme comes from
/// `X-Forwarded-Proto`, falling back to `http` for loopback hosts and `https`
/// for everything else.
pub fn base_url(headers: &HeaderMap, public_url: Option<&str>) -> String {
    if let Some(url) = public_url.filter(|u| !u.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(if is_loopback(host) { "http" } else { "https" });

    format!("{proto}://{host}")
}

fn is_loopback(host: &str) -> bool {
    let name = if host.starts_with('[') {
        host.split_once(']').map_or(host, |(h, _)| h).trim_start_matches('[')
    } else {
        host.rsplit_once(':').map_or(host, |(h, _)| h)
    };
    matches!(name, "localhost" | "127.0.0.1" | "::1")
}

fn no_store<T: IntoResponse>(status: StatusCode, body: T) -> Response {
    (
        status,
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn protected_resource(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let base = state.base_url(&headers);
    Json(ProtectedResourceMetadata::for_base(&base)).into_response()
}

async fn authorization_server(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let base = state.base_url(&headers);
    Json(AuthorizationServerMetadata::for_base(&base)).into_response()
}

async fn register(
    State(state): State<AuthState>,
    body: Result<Json<RegistrationRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return OAuthError::InvalidRequest("invalid JSON body".into()).into_response();
    };

    match state.server.register(request).await {
        Ok(client) => no_store(StatusCode::CREATED, Json(RegistrationResponse::from(&client))),
        Err(e) => e.into_response(),
    }
}

async fn render_error(
    state: &AuthState,
    params: &AuthorizeParams,
    error: &AuthorizeError,
    query: &str,
) -> Response {
    let client_name = state
        .server
        .client(&params.client_id)
        .await
        .ok()
        .flatten()
        .map(|c| c.client_name);
    Html(login_page(
        client_name.as_deref(),
        Some(&error.to_string()),
        query,
    ))
    .into_response()
}

async fn authorize_form(
    State(state): State<AuthState>,
    params: Result<Query<AuthorizeParams>, QueryRejection>,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    let Ok(Query(params)) = params else {
        return Html(login_page(
            None,
            Some(&AuthorizeError::MissingParameters.to_string()),
            &query,
        ))
        .into_response();
    };

    match state.server.validate_authorization(&params).await {
        Ok(client) => Html(login_page(Some(&client.client_name), None, &query)).into_response(),
        Err(e) => render_error(&state, &params, &e, &query).await,
    }
}

async fn authorize_submit(
    State(state): State<AuthState>,
    params: Result<Query<AuthorizeParams>, QueryRejection>,
    RawQuery(query): RawQuery,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let query = query.unwrap_or_default();
    let params = params.map(|Query(p)| p).unwrap_or_default();
    let form = form.map(|Form(f)| f).unwrap_or_default();

    match state.server.complete_login(&params, form).await {
        Ok(location) => Redirect::to(location.as_str()).into_response(),
        Err(e) => render_error(&state, &params, &e, &query).await,
    }
}

/// Client id from `Authorization: Basic`, for `client_secret_basic` clients.
fn basic_client_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (id, _) = decoded.split_once(':')?;
    url::form_urlencoded::parse(format!("id={id}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .filter(|id| !id.is_empty())
}

async fn token(
    State(state): State<AuthState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let Ok(Form(mut request)) = form else {
        return OAuthError::InvalidRequest("invalid form body".into()).into_response();
    };
    if request.client_id.is_empty() {
        if let Some(id) = basic_client_id(&headers) {
            request.client_id = id;
        }
    }

    let issuer = state.base_url(&headers);
    match state.server.token(&request, &issuer).await {
        Ok(response) => no_store(StatusCode::OK, Json(response)),
        Err(e) => e.into_response(),
    }
}
