use thiserror::Error;

use crate::schema::{
    JSONRPCError, RequestId, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Signature, structure or expiry check failed. Which one is not reported.
    #[error("Invalid token")]
    InvalidToken,

    #[error("Failed to sign token: {0}")]
    TokenSigning(String),

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

impl Error {
    /// The JSON-RPC error object to answer request `id` with.
    pub fn to_jsonrpc_error(&self, id: RequestId) -> JSONRPCError {
        let code = match self {
            Error::MethodNotFound(_) => METHOD_NOT_FOUND,
            Error::InvalidParams(_) | Error::ToolNotFound(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        JSONRPCError::new(Some(id), code, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
