use std::path::PathBuf;

use clap::Parser;

use crate::backend::DEFAULT_THINGS_ENDPOINT;

const DEFAULT_PORT: u16 = 8080;

/// MCP server for Things Cloud with a built-in OAuth 2.1 authorization server.
#[derive(Parser, Debug, Clone)]
#[command(name = "things-mcp", version, about)]
pub struct Config {
    /// Address to listen on. Defaults to 0.0.0.0 on $PORT (or 8080).
    #[arg(long, env = "BIND_ADDR")]
    pub bind: Option<String>,

    /// Port to listen on when no bind address is given
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Externally visible base URL, e.g. https://things.example.com
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Secret for signing access tokens. A random one is used if unset,
    /// which invalidates all tokens on restart.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Directory for persisted OAuth state. State is kept in memory if unset.
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Things Cloud API endpoint
    #[arg(long, env = "THINGS_API_ENDPOINT", default_value = DEFAULT_THINGS_ENDPOINT)]
    pub things_endpoint: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        match &self.bind {
            Some(bind) if !bind.is_empty() => bind.clone(),
            _ => format!("0.0.0.0:{}", self.port.unwrap_or(DEFAULT_PORT)),
        }
    }

    /// The configured signing secret, if any.
    pub fn jwt_secret_bytes(&self) -> Option<Vec<u8>> {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
    }

    pub fn public_url(&self) -> Option<String> {
        self.public_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    }
}
