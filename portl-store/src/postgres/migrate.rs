use sqlx::PgPool;

use crate::error::StoreError;

/// Create or upgrade the outbox table.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    let migrator = sqlx::migrate!("./migrations");
    migrator.run(pool).await?;
    Ok(())
}
