//! Postgres-backed registry for production deployments.
//!
//! Schema lives in `migrations/` and is applied on connect. Concurrent
//! orchestrator instances are tolerated because every mutation is a single
//! row-level statement; no multi-row transactions are used.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{SandboxPatch, SandboxRecord, SandboxStatus, SandboxStore, StopReason, StoreError};

const SELECT_COLUMNS: &str = r#"
    sandbox_id, user_id, container_id, status, hot_path, cold_path, cwd,
    config, ttl_seconds, expires_at, last_heartbeat_at, stopped_at,
    stop_reason, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects, bounds the pool, and runs embedded migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SandboxStore for PostgresStore {
    async fn save(&self, record: SandboxRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                sandbox_id, user_id, container_id, status, hot_path, cold_path,
                cwd, config, ttl_seconds, expires_at, last_heartbeat_at,
                stopped_at, stop_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(record.sandbox_id)
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(record.status.as_str())
        .bind(&record.hot_path)
        .bind(&record.cold_path)
        .bind(&record.cwd)
        .bind(&record.config)
        .bind(record.ttl_seconds)
        .bind(record.expires_at)
        .bind(record.last_heartbeat_at)
        .bind(record.stopped_at)
        .bind(record.stop_reason.map(StopReason::as_str))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(record.sandbox_id)
            } else {
                unavailable(err)
            }
        })?;

        Ok(())
    }

    async fn get(&self, sandbox_id: Uuid) -> Result<SandboxRecord, StoreError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM sandboxes WHERE sandbox_id = $1");
        let row = sqlx::query(&query)
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(sandbox_id))?;

        map_sandbox(&row)
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>, StoreError> {
        let rows = match user_id {
            Some(user) => {
                let query =
                    format!("SELECT {SELECT_COLUMNS} FROM sandboxes WHERE user_id = $1");
                sqlx::query(&query)
                    .bind(user)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(unavailable)?
            }
            None => {
                let query = format!("SELECT {SELECT_COLUMNS} FROM sandboxes");
                sqlx::query(&query)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(unavailable)?
            }
        };

        rows.iter().map(map_sandbox).collect()
    }

    async fn update(
        &self,
        sandbox_id: Uuid,
        patch: SandboxPatch,
    ) -> Result<SandboxRecord, StoreError> {
        if patch.is_empty() {
            // Still advances updated_at via the trigger, matching the
            // memory backend's behaviour for heartbeat-shaped patches.
            let query = format!(
                "UPDATE sandboxes SET updated_at = now() WHERE sandbox_id = $1 \
                 RETURNING {SELECT_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(sandbox_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?
                .ok_or(StoreError::NotFound(sandbox_id))?;
            return map_sandbox(&row);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE sandboxes SET ");
        let mut fields = builder.separated(", ");

        if let Some(status) = patch.status {
            fields.push("status = ");
            fields.push_bind_unseparated(status.as_str());
        }
        if let Some(container_id) = patch.container_id {
            fields.push("container_id = ");
            fields.push_bind_unseparated(container_id);
        }
        if let Some(cwd) = patch.cwd {
            fields.push("cwd = ");
            fields.push_bind_unseparated(cwd);
        }
        if let Some(config) = patch.config {
            fields.push("config = ");
            fields.push_bind_unseparated(config);
        }
        if let Some(expires_at) = patch.expires_at {
            fields.push("expires_at = ");
            fields.push_bind_unseparated(expires_at);
        }
        if let Some(heartbeat) = patch.last_heartbeat_at {
            fields.push("last_heartbeat_at = ");
            fields.push_bind_unseparated(heartbeat);
        }
        if let Some(stopped_at) = patch.stopped_at {
            fields.push("stopped_at = ");
            fields.push_bind_unseparated(stopped_at);
        }
        if let Some(reason) = patch.stop_reason {
            fields.push("stop_reason = ");
            fields.push_bind_unseparated(reason.as_str());
        }

        builder.push(" WHERE sandbox_id = ");
        builder.push_bind(sandbox_id);
        builder.push(format!(" RETURNING {SELECT_COLUMNS}"));

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or(StoreError::NotFound(sandbox_id))?;

        map_sandbox(&row)
    }

    async fn delete(&self, sandbox_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE sandbox_id = $1")
            .bind(sandbox_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(sandbox_id));
        }
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>, StoreError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM sandboxes \
             WHERE status IN ('ready', 'running') AND expires_at <= $1"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.iter().map(map_sandbox).collect()
    }
}

fn map_sandbox(row: &PgRow) -> Result<SandboxRecord, StoreError> {
    let status: String = row.try_get("status").map_err(unavailable)?;
    let stop_reason: Option<String> = row.try_get("stop_reason").map_err(unavailable)?;

    Ok(SandboxRecord {
        sandbox_id: row.try_get("sandbox_id").map_err(unavailable)?,
        user_id: row.try_get("user_id").map_err(unavailable)?,
        container_id: row.try_get("container_id").map_err(unavailable)?,
        status: SandboxStatus::from_str(&status).map_err(StoreError::Unavailable)?,
        hot_path: row.try_get("hot_path").map_err(unavailable)?,
        cold_path: row.try_get("cold_path").map_err(unavailable)?,
        cwd: row.try_get("cwd").map_err(unavailable)?,
        config: row.try_get::<Value, _>("config").map_err(unavailable)?,
        ttl_seconds: row.try_get("ttl_seconds").map_err(unavailable)?,
        expires_at: row.try_get("expires_at").map_err(unavailable)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(unavailable)?,
        stopped_at: row.try_get("stopped_at").map_err(unavailable)?,
        stop_reason: stop_reason
            .map(|raw| StopReason::from_str(&raw))
            .transpose()
            .map_err(StoreError::Unavailable)?,
        created_at: row.try_get("created_at").map_err(unavailable)?,
        updated_at: row.try_get("updated_at").map_err(unavailable)?,
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| code.as_ref() == "23505")
            .unwrap_or_else(|| db_err.message().contains("unique")),
        _ => false,
    }
}

fn unavailable(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Unavailable(err.into())
}
