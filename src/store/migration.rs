//! Schema migrations for the loader's own bookkeeping tables.
//!
//! Applied on ignite by the Rocket fairing and by the CLI before any job
//! runs. Target tables are not managed here; the catalog creates them.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");

    // verifies checksums of applied migrations before running new ones
    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}
