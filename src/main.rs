use std::sync::Arc;

use clap::Parser;
use rand::RngCore;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use things_mcp::{
    auth::{FileStore, OAuthServer, TokenCodec},
    backend::CloudClient,
    tools::AccountTools,
    Config, Result, Server,
};

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("things_mcp=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn signing_secret(config: &Config) -> Vec<u8> {
    config.jwt_secret_bytes().unwrap_or_else(|| {
        warn!("JWT_SECRET not set; using a random secret, tokens will not survive a restart");
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    })
}

async fn run(config: Config) -> Result<()> {
    let cloud = Arc::new(CloudClient::new(&config.things_endpoint)?);
    let codec = TokenCodec::new(&signing_secret(&config))?;

    let mut oauth = OAuthServer::new(codec, cloud.clone());
    if let Some(dir) = &config.data_dir {
        let store = FileStore::open(dir).await?;
        info!("OAuth state persisted to {}", store.path().display());
        oauth = oauth.with_store(Arc::new(store));
    }

    let handle = Server::new(oauth, cloud, AccountTools::new())
        .with_public_url(config.public_url())
        .serve_http(config.bind_addr())
        .await?;

    info!("MCP endpoint: {}/mcp", handle.url());
    info!(
        "OAuth metadata: {}/.well-known/oauth-authorization-server",
        handle.url()
    );

    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        shutdown.cancel();
    });

    handle.wait().await
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_tracing(config.log_json);

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
