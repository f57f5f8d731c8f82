//! Tools exposed over MCP.
//!
//! A [`Toolbox`] advertises tools and runs them against the caller's backend
//! session. The endpoint resolves the session before calling in, so tool
//! implementations never see credentials.

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{
    auth::mask_identity,
    backend::AccountSession,
    error::{Error, Result},
    schema::{CallToolResult, Tool, ToolInputSchema},
};

#[async_trait]
pub trait Toolbox<S>: Send + Sync + 'static {
    fn tools(&self) -> Vec<Tool>;

    /// Runs `name`. Unknown tools return [`Error::ToolNotFound`].
    async fn call(
        &self,
        session: Arc<S>,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult>;
}

/// Reports the account a session is logged in as.
pub struct AccountTools<S> {
    _session: PhantomData<fn() -> S>,
}

impl<S> AccountTools<S> {
    pub const ACCOUNT_INFO: &'static str = "account_info";

    pub fn new() -> Self {
        Self {
            _session: PhantomData,
        }
    }
}

impl<S> Default for AccountTools<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: AccountSession> Toolbox<S> for AccountTools<S> {
    fn tools(&self) -> Vec<Tool> {
        vec![Tool::new(Self::ACCOUNT_INFO, ToolInputSchema::default())
            .with_description("Show the Things Cloud account this connection is signed in as")
            .with_read_only_hint(true)
            .with_open_world_hint(false)]
    }

    async fn call(
        &self,
        session: Arc<S>,
        name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<CallToolResult> {
        if name != Self::ACCOUNT_INFO {
            return Err(Error::ToolNotFound(name.to_string()));
        }

        let account = session.account();
        let summary = json!({
            "email": account.email.as_deref().unwrap_or(session.identity()),
            "status": account.status,
        });
        Ok(CallToolResult::new()
            .with_text_content(format!(
                "Signed in as {}",
                mask_identity(session.identity())
            ))
            .with_structured_content(summary))
    }
}
