//! Reference backend: `cardsync serve`.

use std::path::PathBuf;

use anyhow::Result;

use cardsync::config::{CardsyncConfig, ENV_SIGNING_SECRET};
use cardsync::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: &CardsyncConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }

    let signing_secret = match &config.toml.uploads.signing_secret {
        Some(secret) => secret.clone(),
        None => {
            tracing::warn!(
                "no signing secret configured (set {}); signed URLs will not survive a restart",
                ENV_SIGNING_SECRET
            );
            uuid::Uuid::new_v4().to_string()
        }
    };

    start_server(ServerConfig {
        port: port.unwrap_or(config.toml.server.port),
        db_path: db_path.unwrap_or_else(|| config.db_path()),
        tables: config.toml.store.tables.clone(),
        blob_dir: config.blob_dir(),
        signing_secret,
        dev_mode: dev || config.toml.server.dev,
    })
    .await
}
