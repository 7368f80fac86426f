//! Project setup: `cardsync init`.

use anyhow::{Context, Result};

use cardsync::config::CardsyncConfig;
use cardsync::store::sqlite::SqliteStore;

pub fn cmd_init(config: &CardsyncConfig) -> Result<()> {
    if config.write_default()? {
        println!("Created {}", config.config_file().display());
    } else {
        println!("Config already exists at {}", config.config_file().display());
    }

    let db_path = config.db_path();
    SqliteStore::open(&db_path, &config.toml.store.tables)?;
    println!(
        "Provisioned {} table(s) in {}",
        config.toml.store.tables.len(),
        db_path.display()
    );

    let blob_dir = config.blob_dir();
    std::fs::create_dir_all(&blob_dir)
        .with_context(|| format!("Failed to create blob directory {}", blob_dir.display()))?;
    println!("Blob directory: {}", blob_dir.display());

    tracing::info!(db = %db_path.display(), "project initialized");
    Ok(())
}
