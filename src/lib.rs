//! # things-mcp
//!
//! An MCP server for Things Cloud, with a self-hosted OAuth 2.1
//! authorization server in front of it.
//!
//! Things Cloud only understands email and password. MCP clients, on the
//! other hand, want to run an OAuth flow and hold a bearer token. This crate
//! bridges the two:
//!
//! - [`auth`] registers clients, logs users in against the backend, and
//!   issues signed access tokens and rotating refresh tokens;
//! - [`auth::CredentialBridge`] turns a bearer token back into the tenant's
//!   backend credentials;
//! - [`session::SessionCache`] builds each tenant's backend session once and
//!   shares it between requests;
//! - [`mcp`] serves the protected JSON-RPC endpoint that ties them together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use things_mcp::{
//!     auth::{OAuthServer, TokenCodec},
//!     backend::CloudClient,
//!     tools::AccountTools,
//!     Result, Server,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let cloud = Arc::new(CloudClient::new("https://cloud.culturedcode.com")?);
//!     let codec = TokenCodec::new(b"change-me")?;
//!     let oauth = OAuthServer::new(codec, cloud.clone());
//!
//!     let handle = Server::new(oauth, cloud, AccountTools::new())
//!         .serve_http("127.0.0.1:8080")
//!         .await?;
//!     handle.wait().await
//! }
//! ```

pub mod auth;
pub mod backend;
pub mod config;
mod error;
pub mod http;
pub mod mcp;
pub mod schema;
pub mod session;
pub mod testutils;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
pub use http::{Server, ServerHandle};
