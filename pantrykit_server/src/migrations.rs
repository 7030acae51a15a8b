use sqlx::PgPool;
use tracing::info;

async fn execute_migration_file(
  pool: &PgPool,
  file_name: &str,
  sql_content: &str,
) -> Result<(), sqlx::Error> {
  info!("Running migration: {}", file_name);

  for statement in sql_content.split(';') {
    let statement = statement.trim();
    if !statement.is_empty() {
      sqlx::query(statement).execute(pool).await?;
    }
  }

  Ok(())
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
  info!("Running embedded migrations");

  execute_migration_file(
    pool,
    "0001_initial_schema",
    include_str!("../migrations/0001_initial_schema.sql"),
  )
  .await?;

  info!("Migrations completed");
  Ok(())
}
