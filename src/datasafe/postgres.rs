use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info};

use super::{DataSafe, DataSafeError};

/// Longest key the `writer` table accepts.
pub const MAX_KEY_LENGTH: usize = 500;

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS writer (
        key VARCHAR(500) PRIMARY KEY,
        data TEXT NOT NULL
    )
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO writer (key, data) VALUES ($1, $2)
    ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data
"#;

const SELECT_SQL: &str = "SELECT data FROM writer WHERE key = $1";

/// Stores session content in a PostgreSQL table.
#[derive(Default)]
pub struct PostgresDataSafe {
    pool: OnceCell<PgPool>,
}

impl PostgresDataSafe {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> Result<&PgPool, DataSafeError> {
        self.pool.get().ok_or(DataSafeError::NotConfigured)
    }
}

fn check_key(key: &str) -> Result<(), DataSafeError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(DataSafeError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LENGTH,
        });
    }
    Ok(())
}

/// Connection level failures mean the database can not be reached right now.
fn classify(e: sqlx::Error) -> DataSafeError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DataSafeError::StorageUnavailable(e.to_string())
        }
        other => DataSafeError::Database(other),
    }
}

#[async_trait]
impl DataSafe for PostgresDataSafe {
    async fn save(&self, key: &str, data: &str) -> Result<(), DataSafeError> {
        let pool = self.pool()?;
        check_key(key)?;

        sqlx::query(UPSERT_SQL)
            .bind(key)
            .bind(data)
            .execute(pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<String, DataSafeError> {
        let pool = self.pool()?;
        check_key(key)?;

        let data: Option<String> = sqlx::query_scalar(SELECT_SQL)
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(classify)?;
        Ok(data.unwrap_or_default())
    }

    async fn configure(&self, config: &str) -> Result<(), DataSafeError> {
        if self.pool.initialized() {
            return Err(DataSafeError::AlreadyConfigured);
        }

        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(60))
            .connect(config.trim())
            .await
            .map_err(|e| {
                error!("postgres: can not open database: {}", e);
                DataSafeError::InvalidConfig(format!("postgres: can not open database: {}", e))
            })?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await.map_err(|e| {
            DataSafeError::InvalidConfig(format!("postgres: can not create table 'writer': {}", e))
        })?;

        self.pool
            .set(pool)
            .map_err(|_| DataSafeError::AlreadyConfigured)?;
        info!("Database connection pool created successfully");
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn flush_and_close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("postgres: pool closed");
        }
    }
}
