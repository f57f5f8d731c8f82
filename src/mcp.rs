//! The protected MCP endpoint.
//!
//! `POST /mcp` is stateless JSON-RPC 2.0: every request carries its own
//! credentials, either a bearer token issued by [`crate::auth`] or Basic
//! `email:password`. The caller is resolved before the body is looked at;
//! `tools/call` then fetches the caller's backend session from the
//! [`SessionCache`] and hands it to the [`Toolbox`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    auth::{base_url, mask_identity, CredentialBridge, Secret, PROTECTED_RESOURCE_PATH},
    backend::SessionFactory,
    error::{Error, Result},
    schema::{
        CallToolParams, CallToolResult, Implementation, IncomingMessage, InitializeResult,
        JSONRPCError, JSONRPCRequest, JSONRPCResponse, ListToolsResult, OutgoingMessage,
        LATEST_PROTOCOL_VERSION, PARSE_ERROR,
    },
    session::SessionCache,
    tools::Toolbox,
};

pub const MCP_PATH: &str = "/mcp";

const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, "2025-03-26", "2024-11-05"];

const INSTRUCTIONS: &str = "Tools for the Things Cloud account you signed in with.";

pub struct McpState<F: SessionFactory> {
    pub bridge: CredentialBridge,
    pub sessions: Arc<SessionCache<F>>,
    pub tools: Arc<dyn Toolbox<F::Session>>,
    pub public_url: Option<Arc<str>>,
    pub server_info: Implementation,
}

impl<F: SessionFactory> Clone for McpState<F> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            sessions: self.sessions.clone(),
            tools: self.tools.clone(),
            public_url: self.public_url.clone(),
            server_info: self.server_info.clone(),
        }
    }
}

pub fn routes<F: SessionFactory>(state: McpState<F>) -> Router {
    Router::new()
        .route(MCP_PATH, post(handle_post::<F>).get(handle_get))
        .with_state(state)
}

/// The authenticated tenant behind a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub tenant_id: String,
    pub secret: Secret,
}

fn unauthorized(headers: &HeaderMap, public_url: Option<&str>, error: Option<&str>) -> Response {
    let metadata = format!(
        "{}{}",
        base_url(headers, public_url),
        PROTECTED_RESOURCE_PATH
    );
    let challenge = match error {
        Some(error) => format!(r#"Bearer error="{error}", resource_metadata="{metadata}""#),
        None => format!(r#"Bearer resource_metadata="{metadata}""#),
    };

    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": error.unwrap_or("unauthorized"),
            "error_description": "authentication required",
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn decode_basic(encoded: &str) -> Option<Caller> {
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (identity, password) = decoded.split_once(':')?;
    if identity.is_empty() || password.is_empty() {
        return None;
    }
    Some(Caller {
        tenant_id: identity.to_string(),
        secret: Secret::new(password),
    })
}

#[async_trait]
impl<F: SessionFactory> FromRequestParts<McpState<F>> for Caller {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &McpState<F>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let public_url = state.public_url.as_deref();
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return Err(unauthorized(headers, public_url, None));
        };

        if let Some(token) = value.strip_prefix("Bearer ") {
            return match state.bridge.resolve_bearer(token.trim()).await {
                Ok((tenant_id, secret)) => Ok(Caller { tenant_id, secret }),
                Err(Error::InvalidToken | Error::Unauthenticated(_)) => {
                    debug!("Rejected bearer token");
                    Err(unauthorized(headers, public_url, Some("invalid_token")))
                }
                Err(e) => {
                    warn!("Bearer resolution failed: {}", e);
                    Err((StatusCode::INTERNAL_SERVER_ERROR, "credential lookup failed")
                        .into_response())
                }
            };
        }

        if let Some(encoded) = value.strip_prefix("Basic ") {
            return decode_basic(encoded)
                .ok_or_else(|| unauthorized(headers, public_url, Some("invalid_request")));
        }

        Err(unauthorized(headers, public_url, None))
    }
}

async fn handle_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "Method not allowed",
    )
        .into_response()
}

async fn handle_post<F: SessionFactory>(
    State(state): State<McpState<F>>,
    caller: Caller,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(version) = headers
        .get("MCP-Protocol-Version")
        .and_then(|v| v.to_str().ok())
    {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return (StatusCode::BAD_REQUEST, "Unsupported protocol version").into_response();
        }
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            let error = JSONRPCError::new(None, PARSE_ERROR, "Parse error");
            return (StatusCode::BAD_REQUEST, Json(OutgoingMessage::Error(error))).into_response();
        }
    };

    let request = match IncomingMessage::from_value(value) {
        Ok(IncomingMessage::Request(request)) => request,
        Ok(IncomingMessage::Notification(notification)) => {
            debug!("Notification {}", notification.method);
            return StatusCode::ACCEPTED.into_response();
        }
        Err(error) => {
            return (StatusCode::BAD_REQUEST, Json(OutgoingMessage::Error(error))).into_response();
        }
    };

    debug!(
        "MCP {} from {}",
        request.method,
        mask_identity(&caller.tenant_id)
    );
    let id = request.id.clone();
    let message = match dispatch(&state, &caller, request).await {
        Ok(result) => OutgoingMessage::Response(JSONRPCResponse::new(id, result)),
        Err(e) => OutgoingMessage::Error(e.to_jsonrpc_error(id)),
    };
    Json(message).into_response()
}

async fn dispatch<F: SessionFactory>(
    state: &McpState<F>,
    caller: &Caller,
    request: JSONRPCRequest,
) -> Result<Value> {
    match request.method.as_str() {
        "initialize" => {
            let requested = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str);
            let mut result =
                InitializeResult::new(&state.server_info.name, &state.server_info.version)
                    .with_tools(false)
                    .with_instructions(INSTRUCTIONS);
            result.server_info = state.server_info.clone();
            if let Some(version) = requested.filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v)) {
                result.protocol_version = version.to_string();
            }
            Ok(serde_json::to_value(result)?)
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(serde_json::to_value(ListToolsResult {
            tools: state.tools.tools(),
        })?),
        "tools/call" => {
            let params: CallToolParams = request
                .params
                .ok_or_else(|| Error::InvalidParams("missing params".into()))
                .and_then(|p| {
                    serde_json::from_value(p).map_err(|e| Error::InvalidParams(e.to_string()))
                })?;
            Ok(serde_json::to_value(call_tool(state, caller, params).await?)?)
        }
        other => Err(Error::MethodNotFound(other.to_string())),
    }
}

async fn call_tool<F: SessionFactory>(
    state: &McpState<F>,
    caller: &Caller,
    params: CallToolParams,
) -> Result<CallToolResult> {
    let session = match state
        .sessions
        .get_or_create(&caller.tenant_id, &caller.secret)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(
                "No backend session for {}: {}",
                mask_identity(&caller.tenant_id),
                e
            );
            return Ok(CallToolResult::error(format!(
                "Failed to connect to Things Cloud: {e}"
            )));
        }
    };

    let arguments = params.arguments.unwrap_or_default();
    match state.tools.call(session, &params.name, arguments).await {
        Ok(result) => Ok(result),
        Err(e @ (Error::ToolNotFound(_) | Error::InvalidParams(_))) => Err(e),
        Err(e) => Ok(CallToolResult::error(e.to_string())),
    }
}
