//! Applies the embedded schema migrations to `DATABASE_URL` (or the configured database).

use optical_settlement::{config, migrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => url,
        _ => config::load_config()?.database_url,
    };
    config::init_tracing("info", false);

    migrator::run_migration(&database_url).await
}
