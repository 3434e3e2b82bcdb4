//! Registry of sandbox records.
//!
//! Every sandbox the control plane has ever provisioned is represented by a
//! [`SandboxRecord`]. Records are never physically deleted on teardown; they
//! transition into a terminal status instead so the audit trail survives the
//! container. Two interchangeable backends implement [`SandboxStore`]: an
//! in-process map for development and tests ([`memory::MemoryStore`]) and a
//! Postgres-backed store for production ([`postgres::PostgresStore`], behind
//! the `postgres` feature).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod protocol;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle states of a sandbox record.
///
/// Transitions form a DAG enforced by [`SandboxStatus::can_transition`]:
/// `creating -> starting -> ready -> running -> shutting_down -> stopped`,
/// with `failed` reachable while provisioning, `expired` reachable from
/// `ready`/`running` via the expiry sweep, and `shutting_down` reachable
/// from every live state so a destroy can interrupt provisioning.
/// `stopped` and `failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Starting,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
    Expired,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Ready => "ready",
            SandboxStatus::Running => "running",
            SandboxStatus::ShuttingDown => "shutting_down",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Expired => "expired",
        }
    }

    /// Absorbing states. No transition ever leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxStatus::Stopped | SandboxStatus::Failed)
    }

    /// States in which the record may be backed by a live container and is
    /// therefore in scope for reconciliation.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SandboxStatus::Creating
                | SandboxStatus::Starting
                | SandboxStatus::Ready
                | SandboxStatus::Running
                | SandboxStatus::ShuttingDown
        )
    }

    /// States in which exec, heartbeat and lease bookkeeping are legal.
    pub fn accepts_exec(self) -> bool {
        matches!(self, SandboxStatus::Ready | SandboxStatus::Running)
    }

    pub fn can_transition(self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, to) {
            (Creating, Starting) | (Creating, Failed) | (Creating, ShuttingDown) => true,
            (Starting, Ready) | (Starting, Failed) | (Starting, ShuttingDown) => true,
            (Ready, Running) | (Ready, Expired) | (Ready, ShuttingDown) => true,
            (Running, Expired) | (Running, ShuttingDown) => true,
            (Expired, ShuttingDown) => true,
            (ShuttingDown, Stopped) | (ShuttingDown, Failed) => true,
            _ => false,
        }
    }
}

impl FromStr for SandboxStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "creating" => Ok(SandboxStatus::Creating),
            "starting" => Ok(SandboxStatus::Starting),
            "ready" => Ok(SandboxStatus::Ready),
            "running" => Ok(SandboxStatus::Running),
            "shutting_down" => Ok(SandboxStatus::ShuttingDown),
            "stopped" => Ok(SandboxStatus::Stopped),
            "failed" => Ok(SandboxStatus::Failed),
            "expired" => Ok(SandboxStatus::Expired),
            other => Err(anyhow::anyhow!("unknown sandbox status '{other}'")),
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a sandbox reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    Expired,
    Error,
    GracefulShutdown,
    Admin,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::UserRequested => "user_requested",
            StopReason::Expired => "expired",
            StopReason::Error => "error",
            StopReason::GracefulShutdown => "graceful_shutdown",
            StopReason::Admin => "admin",
        }
    }
}

impl FromStr for StopReason {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user_requested" => Ok(StopReason::UserRequested),
            "expired" => Ok(StopReason::Expired),
            "error" => Ok(StopReason::Error),
            "graceful_shutdown" => Ok(StopReason::GracefulShutdown),
            "admin" => Ok(StopReason::Admin),
            other => Err(anyhow::anyhow!("unknown stop reason '{other}'")),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sandbox's lifetime as the registry sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub sandbox_id: Uuid,
    pub user_id: String,
    /// Engine-local container id; unset until creation succeeded.
    pub container_id: Option<String>,
    pub status: SandboxStatus,
    pub hot_path: String,
    pub cold_path: String,
    /// Server-tracked working directory for subsequent execs.
    pub cwd: String,
    /// Opaque per-sandbox options and agent-reported metadata.
    pub config: Value,
    pub ttl_seconds: i64,
    /// Lease deadline; set on the first transition into ready/running.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    /// Fresh record in `creating`, with the protocol's default mount points
    /// and the cwd seeded to the hot tier.
    pub fn new(user_id: impl Into<String>, ttl_seconds: i64, config: Value) -> Self {
        let now = Utc::now();
        Self {
            sandbox_id: Uuid::new_v4(),
            user_id: user_id.into(),
            container_id: None,
            status: SandboxStatus::Creating,
            hot_path: protocol::DEFAULT_HOT_PATH.to_string(),
            cold_path: protocol::DEFAULT_COLD_PATH.to_string(),
            cwd: protocol::DEFAULT_HOT_PATH.to_string(),
            config,
            ttl_seconds,
            expires_at: None,
            last_heartbeat_at: None,
            stopped_at: None,
            stop_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A lease that expires exactly now is already expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.accepts_exec()
            && self.expires_at.map(|deadline| deadline <= now).unwrap_or(false)
    }
}

/// Partial update applied atomically by [`SandboxStore::update`].
///
/// `container_id` is doubly optional so a patch can distinguish "leave as is"
/// from "clear the column".
#[derive(Debug, Default, Clone)]
pub struct SandboxPatch {
    pub status: Option<SandboxStatus>,
    pub container_id: Option<Option<String>>,
    pub cwd: Option<String>,
    pub config: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}

impl SandboxPatch {
    pub fn status(status: SandboxStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.container_id.is_none()
            && self.cwd.is_none()
            && self.config.is_none()
            && self.expires_at.is_none()
            && self.last_heartbeat_at.is_none()
            && self.stopped_at.is_none()
            && self.stop_reason.is_none()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sandbox {0} already exists")]
    Conflict(Uuid),
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Uniform persistence interface for sandbox records.
///
/// Individual operations are atomic; no cross-record transactions are
/// offered or needed. `update` advances `updated_at` on every call.
#[async_trait]
pub trait SandboxStore: Send + Sync + 'static {
    /// Insert a new record. Fails with [`StoreError::Conflict`] if the
    /// sandbox id is already present.
    async fn save(&self, record: SandboxRecord) -> Result<(), StoreError>;

    async fn get(&self, sandbox_id: Uuid) -> Result<SandboxRecord, StoreError>;

    /// All records owned by `user_id`, or every record when `None`
    /// (background loops only; never exposed over HTTP). Order is
    /// unspecified.
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<SandboxRecord>, StoreError>;

    /// Apply `patch` atomically and return the updated record.
    async fn update(
        &self,
        sandbox_id: Uuid,
        patch: SandboxPatch,
    ) -> Result<SandboxRecord, StoreError>;

    /// Hard removal. The lifecycle manager marks records stopped instead of
    /// deleting; this exists for operator tooling.
    async fn delete(&self, sandbox_id: Uuid) -> Result<(), StoreError>;

    /// Records in `ready`/`running` whose lease deadline is at or before
    /// `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxRecord>, StoreError>;
}
