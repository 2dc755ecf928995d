//! Schema migration runner.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    async fn migrate(&self) -> Result<()>;
}

/// Applies the SQL migrations in a directory to a Postgres database.
pub struct PostgresMigrator {
    database_url: String,
    migrations_dir: PathBuf,
}

impl PostgresMigrator {
    pub fn new(database_url: impl Into<String>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            migrations_dir: migrations_dir.into(),
        }
    }
}

#[async_trait]
impl SchemaMigrator for PostgresMigrator {
    async fn migrate(&self) -> Result<()> {
        let migrator = sqlx::migrate::Migrator::new(self.migrations_dir.as_path())
            .await
            .with_context(|| {
                format!(
                    "Failed to load migrations from {}",
                    self.migrations_dir.display()
                )
            })?;

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&self.database_url)
            .await
            .context("Failed to connect to database")?;

        let known = migrator.iter().count();
        migrator
            .run(&pool)
            .await
            .context("Failed to apply migrations")?;
        pool.close().await;

        info!(
            dir = %self.migrations_dir.display(),
            known,
            "Migrations applied"
        );
        Ok(())
    }
}
