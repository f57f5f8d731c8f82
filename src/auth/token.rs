//! Signed access tokens.
//!
//! Access tokens are HS256 JWTs carrying `{sub, iss, iat, exp, scope}`. They
//! are never stored: a token is valid exactly when its signature checks out
//! under the server secret and `exp` has not passed. Every verification
//! failure collapses into [`Error::InvalidToken`] so callers cannot learn
//! which check failed.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::types::{ACCESS_TOKEN_TTL_SECS, SCOPE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant identity (the backend login).
    #[serde(default)]
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub scope: String,
}

impl Claims {
    /// Claims for a fresh access token issued now.
    pub fn access(tenant_id: &str, issuer: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: tenant_id.to_string(),
            iss: issuer.to_string(),
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECS,
            scope: SCOPE.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidConfiguration(
                "token signing secret must not be empty".into(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::TokenSigning(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| Error::InvalidToken)
    }

    /// Signs a one-hour access token for `tenant_id`.
    pub fn issue_access_token(&self, tenant_id: &str, issuer: &str) -> Result<String> {
        self.sign(&Claims::access(tenant_id, issuer))
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}
