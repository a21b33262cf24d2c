pub mod mapping;
pub mod sqlite;

pub use sqlite::{SqliteStore, SqliteTaskBroker};

use anyhow::{Context, Result};
use snowcast_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// 表结构，启动时以 `IF NOT EXISTS` 方式创建
///
/// 时间统一存储为 UTC 毫秒整数，便于范围比较与排序。
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS broker_tasks (
        id TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        handler_name TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        eta_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        pipeline_run_id TEXT,
        last_error TEXT,
        visible_until_ms INTEGER,
        created_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_broker_tasks_ready ON broker_tasks (queue_name, status, eta_ms)",
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        id INTEGER PRIMARY KEY,
        external_identifier TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        active INTEGER NOT NULL,
        last_fetch_ms INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS observations (
        station_id TEXT NOT NULL,
        batch_start_ms INTEGER NOT NULL,
        batch_end_ms INTEGER NOT NULL,
        observed_ms INTEGER NOT NULL,
        observed_values TEXT NOT NULL,
        PRIMARY KEY (station_id, batch_start_ms, batch_end_ms, observed_ms)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_observations_observed ON observations (observed_ms)",
    r#"
    CREATE TABLE IF NOT EXISTS simulation_results (
        run_id TEXT NOT NULL,
        config_identifier TEXT NOT NULL,
        output_path TEXT NOT NULL,
        output_files TEXT NOT NULL,
        exit_code INTEGER,
        duration_ms INTEGER,
        created_ms INTEGER NOT NULL,
        PRIMARY KEY (run_id, config_identifier)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        trigger_label TEXT NOT NULL,
        stage TEXT NOT NULL,
        stages TEXT NOT NULL,
        created_ms INTEGER NOT NULL,
        updated_ms INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_label ON pipeline_runs (trigger_label, created_ms)",
];

/// SQLite 连接池管理
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("无效的数据库URL: {}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let in_memory = config.is_in_memory();
        let max_connections = if in_memory { 1 } else { config.max_connections };

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.url))?;

        info!("Connected to SQLite database {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("创建数据库表结构失败")?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
