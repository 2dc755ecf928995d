//! Schema migration command: `shipyard migrate`.

use anyhow::Result;

use shipyard::config::PlatformConfig;
use shipyard::migration::{PostgresMigrator, SchemaMigrator};

pub async fn cmd_migrate(config: &PlatformConfig) -> Result<()> {
    PostgresMigrator::new(config.database_url.as_str(), config.migrations_dir.clone())
        .migrate()
        .await
}
