use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use super::run_pending;
    use crate::connect_with_settings;

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "sales_conversations",
        "sales_metrics",
        "idx_sales_conversations_sales_rep",
        "idx_sales_metrics_close_date",
    ];

    #[tokio::test]
    async fn migrations_create_managed_schema_objects() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        run_pending(&pool).await.expect("migrations should apply");

        for name in MANAGED_SCHEMA_OBJECTS {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE name = ?")
                    .bind(name)
                    .fetch_one(&pool)
                    .await
                    .expect("schema lookup should succeed");
            assert_eq!(count, 1, "expected schema object `{name}`");
        }

        run_pending(&pool).await.expect("re-running migrations should be a no-op");
        pool.close().await;
    }
}
