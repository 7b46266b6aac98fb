use anyhow::{bail, Context};
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::info;

use topup_api::migrator::Migrator;

/// Usage: migration [up|down|status|fresh]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "up".to_string());

    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("APP__DATABASE_URL"))
        .unwrap_or_else(|_| "sqlite://topup.db?mode=rwc".to_string());
    info!("Connecting to database: {}", database_url);

    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .context("failed to connect to database")?;

    match command.as_str() {
        "up" => {
            Migrator::up(&db, None).await?;
            info!("Migrations applied");
        }
        "down" => {
            Migrator::down(&db, Some(1)).await?;
            info!("Rolled back the latest migration");
        }
        "fresh" => {
            Migrator::fresh(&db).await?;
            info!("Dropped all tables and reapplied migrations");
        }
        "status" => Migrator::status(&db).await?,
        other => bail!("unknown command '{}', expected up, down, status or fresh", other),
    }

    db.close().await?;
    Ok(())
}
