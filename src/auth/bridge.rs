//! Bearer token to backend credential resolution.

use std::sync::Arc;

use tracing::debug;

use super::{
    store::CredentialStore,
    token::TokenCodec,
    types::{mask_identity, Secret},
};
use crate::error::{Error, Result};

/// Unwraps a verified access token back into the tenant's backend login, so
/// OAuth-authenticated calls can reach a backend that only speaks
/// username/password.
#[derive(Clone)]
pub struct CredentialBridge {
    codec: TokenCodec,
    credentials: Arc<dyn CredentialStore>,
}

impl CredentialBridge {
    pub fn new(codec: TokenCodec, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { codec, credentials }
    }

    /// Returns `(tenant_id, tenant_secret)` for a bearer token.
    ///
    /// Fails with [`Error::InvalidToken`] when the signature or expiry check
    /// fails, and with [`Error::Unauthenticated`] when the token carries no
    /// subject or the subject has no credential entry.
    pub async fn resolve_bearer(&self, token: &str) -> Result<(String, Secret)> {
        let claims = self.codec.verify(token)?;
        if claims.sub.is_empty() {
            return Err(Error::Unauthenticated("token has no subject".into()));
        }

        match self.credentials.get_credential(&claims.sub).await? {
            Some(secret) => Ok((claims.sub, secret)),
            None => {
                debug!("No credentials on file for {}", mask_identity(&claims.sub));
                Err(Error::Unauthenticated(
                    "no credentials for token subject".into(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for CredentialBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBridge").finish_non_exhaustive()
    }
}
