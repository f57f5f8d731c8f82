//! Self-hosted OAuth 2.1 authorization server.
//!
//! Implements dynamic client registration (RFC 7591), the authorization code
//! grant with mandatory PKCE S256, and rotating refresh tokens. A successful
//! login binds the tenant's backend credentials to the issued grant, and the
//! [`CredentialBridge`] later turns a bearer token back into those
//! credentials so protected calls can reach the backend.

mod bridge;
mod error;
mod file_store;
mod handlers;
mod pages;
mod pkce;
mod server;
mod store;
mod token;
mod types;

pub use bridge::CredentialBridge;
pub use error::{ErrorBody, OAuthError};
pub use file_store::FileStore;
pub use handlers::{base_url, routes, AUTHORIZATION_SERVER_PATH, PROTECTED_RESOURCE_PATH};
pub use pages::{html_escape, login_page};
pub use pkce::{challenge_for, verify as verify_pkce, METHOD_S256};
pub use server::{AuthorizeError, AuthorizeParams, LoginForm, OAuthServer, TokenRequest};
pub use store::{ClientRegistry, CredentialStore, GrantStore, MemoryStore, Snapshot};
pub use token::{Claims, TokenCodec};
pub use types::*;
