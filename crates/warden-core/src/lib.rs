//! Warden lifecycle manager.
//!
//! Single source of truth for sandbox state transitions: every mutation of a
//! sandbox record flows through [`Orchestrator`], which serializes work per
//! sandbox, drives the container engine through [`driver::ContainerDriver`],
//! and records outcomes in the registry. The HTTP layer on top of this crate
//! carries no domain logic of its own.

pub mod docker;
pub mod driver;
pub mod locks;
pub mod object_store;
pub mod tasks;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use driver::{ContainerDriver, ContainerSpec, ContainerState, DriverError, ResourceLimits};
use warden_store::{
    protocol, SandboxPatch, SandboxRecord, SandboxStatus, SandboxStore, StopReason, StoreError,
};

pub use driver::MAX_COMMAND_BYTES;

/// How many exec audit entries are kept in a record's `config.last_execs`
/// ring before the oldest falls off.
const EXEC_AUDIT_RING: usize = 20;

/// Deadline for a single readiness probe exec inside the poll loop.
const READY_PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Image new sandboxes run unless their config overrides it.
    pub sandbox_image: String,
    pub bucket: String,
    pub region: String,
    pub default_ttl_seconds: i64,
    pub exec_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub default_limits: ResourceLimits,
}

impl OrchestratorConfig {
    pub fn new(
        sandbox_image: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            sandbox_image: sandbox_image.into(),
            bucket: bucket.into(),
            region: region.into(),
            default_ttl_seconds: 7_200,
            exec_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
            ready_poll_interval: Duration::from_millis(500),
            default_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub user_id: String,
    pub ttl_seconds: Option<i64>,
    pub config: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    /// Overrides the record's tracked working directory for this call only.
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// The server-tracked working directory after this exec.
    pub cwd: String,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
    #[error("sandbox {0} not found")]
    NotFound(Uuid),
    #[error("sandbox {0} already exists")]
    Conflict(Uuid),
    #[error("sandbox {sandbox_id} is {status}")]
    InvalidState {
        sandbox_id: Uuid,
        status: SandboxStatus,
    },
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(#[source] anyhow::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            StoreError::Conflict(id) => OrchestratorError::Conflict(id),
            StoreError::Unavailable(inner) => OrchestratorError::StoreUnavailable(inner),
        }
    }
}

fn map_driver(err: DriverError) -> OrchestratorError {
    match err {
        DriverError::EngineUnavailable(inner) => OrchestratorError::EngineUnavailable(inner),
        DriverError::Timeout(deadline) => OrchestratorError::Timeout(deadline),
        DriverError::InvalidInput(message) => OrchestratorError::Validation(message),
        DriverError::NotFound(id) => {
            OrchestratorError::Internal(anyhow::anyhow!("container {id} vanished"))
        }
        DriverError::Engine(inner) => OrchestratorError::Internal(inner),
    }
}

/// User ids become object-store prefixes and registry scopes, so the accepted
/// alphabet is deliberately narrow.
pub fn validate_user_id(user_id: &str) -> Result<(), OrchestratorError> {
    let ok = (1..=255).contains(&user_id.len())
        && user_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(
            "user_id must match [A-Za-z0-9._-]{1,255}".to_string(),
        ))
    }
}

pub struct Orchestrator {
    store: Arc<dyn SandboxStore>,
    driver: Arc<dyn ContainerDriver>,
    config: OrchestratorConfig,
    locks: locks::SandboxLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SandboxStore>,
        driver: Arc<dyn ContainerDriver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            driver,
            config,
            locks: locks::SandboxLocks::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provisions a sandbox end to end: registry row, container create and
    /// start, readiness poll, lease arming. Any failure before `ready` marks
    /// the record `failed` and removes whatever container exists.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_sandbox(
        &self,
        request: CreateSandboxRequest,
    ) -> Result<SandboxRecord, OrchestratorError> {
        validate_user_id(&request.user_id)?;
        let ttl = request.ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        if ttl <= 0 {
            return Err(OrchestratorError::Validation(
                "ttl_seconds must be positive".to_string(),
            ));
        }
        let config = request.config.unwrap_or_else(|| json!({}));
        if !config.is_object() {
            return Err(OrchestratorError::Validation(
                "config must be a JSON object".to_string(),
            ));
        }

        let record = SandboxRecord::new(request.user_id, ttl, config);
        let sandbox_id = record.sandbox_id;
        self.store.save(record.clone()).await?;

        // Provisioning holds the sandbox lock so a racing destroy or the
        // reconcile loop observes either "creating" or the final outcome,
        // never a half-provisioned container.
        let handle = self.locks.handle(sandbox_id);
        let _guard = handle.lock().await;

        // A destroy may have claimed the record between the insert and the
        // lock; provisioning a record that already left `creating` would
        // resurrect it.
        let current = self.store.get(sandbox_id).await?;
        if current.status != SandboxStatus::Creating {
            return Ok(current);
        }

        match self.provision(&record).await {
            Ok(ready) => {
                info!(sandbox_id = %sandbox_id, "sandbox ready");
                Ok(ready)
            }
            Err(err) => {
                warn!(sandbox_id = %sandbox_id, error = %err, "sandbox provisioning failed");
                self.abandon_provisioning(sandbox_id).await;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        record: &SandboxRecord,
    ) -> Result<SandboxRecord, OrchestratorError> {
        let spec = self.container_spec(record);
        let container_id = self.driver.create(&spec).await.map_err(map_driver)?;
        self.store
            .update(
                record.sandbox_id,
                SandboxPatch {
                    container_id: Some(Some(container_id.clone())),
                    ..SandboxPatch::default()
                },
            )
            .await?;

        self.driver.start(&container_id).await.map_err(map_driver)?;
        self.store
            .update(
                record.sandbox_id,
                SandboxPatch::status(SandboxStatus::Starting),
            )
            .await?;

        self.wait_ready(&container_id).await?;

        let expires_at = Utc::now() + ChronoDuration::seconds(record.ttl_seconds);
        let ready = self
            .store
            .update(
                record.sandbox_id,
                SandboxPatch {
                    status: Some(SandboxStatus::Ready),
                    expires_at: Some(expires_at),
                    ..SandboxPatch::default()
                },
            )
            .await?;
        Ok(ready)
    }

    /// Polls until the agent's readiness marker exists, the container dies,
    /// or the deadline passes.
    async fn wait_ready(&self, container_id: &str) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        let probe = format!("test -f {}", protocol::READY_MARKER_PATH);

        loop {
            let status = self.driver.inspect(container_id).await.map_err(map_driver)?;
            match status.state {
                ContainerState::Exited | ContainerState::Dead => {
                    return Err(OrchestratorError::Internal(anyhow::anyhow!(
                        "sandbox container exited during startup (exit code {:?})",
                        status.exit_code
                    )));
                }
                ContainerState::Running => {
                    match self
                        .driver
                        .exec(container_id, &probe, "/", READY_PROBE_DEADLINE)
                        .await
                    {
                        Ok(output) if output.exit_code == Some(0) => return Ok(()),
                        Ok(_) => {}
                        // Transient: the next inspect decides whether the
                        // container is actually gone.
                        Err(DriverError::NotFound(_)) => {}
                        Err(err) => return Err(map_driver(err)),
                    }
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(self.config.ready_timeout));
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    /// Best-effort cleanup after a failed provisioning attempt.
    async fn abandon_provisioning(&self, sandbox_id: Uuid) {
        if let Ok(record) = self.store.get(sandbox_id).await {
            if let Some(container_id) = record.container_id {
                if let Err(err) = self.driver.remove(&container_id).await {
                    warn!(sandbox_id = %sandbox_id, error = %err, "failed to remove container of failed sandbox");
                }
            }
        }
        if let Err(err) = self
            .store
            .update(
                sandbox_id,
                SandboxPatch {
                    status: Some(SandboxStatus::Failed),
                    stopped_at: Some(Utc::now()),
                    stop_reason: Some(StopReason::Error),
                    ..SandboxPatch::default()
                },
            )
            .await
        {
            warn!(sandbox_id = %sandbox_id, error = %err, "failed to mark sandbox failed");
        }
    }

    fn container_spec(&self, record: &SandboxRecord) -> ContainerSpec {
        let cfg = &record.config;
        let image = cfg
            .get("image")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.sandbox_image)
            .to_string();

        let mut limits = self.config.default_limits;
        if let Some(value) = cfg.get("cpu_millis").and_then(Value::as_i64) {
            limits.cpu_millis = value;
        }
        if let Some(value) = cfg.get("memory_bytes").and_then(Value::as_i64) {
            limits.memory_bytes = value;
        }
        if let Some(value) = cfg.get("disk_bytes").and_then(Value::as_i64) {
            limits.disk_bytes = value;
        }

        let mut env = vec![
            (
                protocol::ENV_SANDBOX_ID.to_string(),
                record.sandbox_id.to_string(),
            ),
            (protocol::ENV_USER_ID.to_string(), record.user_id.clone()),
            (
                protocol::ENV_S3_BUCKET.to_string(),
                self.config.bucket.clone(),
            ),
            (
                protocol::ENV_S3_REGION.to_string(),
                self.config.region.clone(),
            ),
            (protocol::ENV_HOT_PATH.to_string(), record.hot_path.clone()),
            (
                protocol::ENV_COLD_PATH.to_string(),
                record.cold_path.clone(),
            ),
            (
                protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS.to_string(),
                self.config.shutdown_timeout.as_secs().to_string(),
            ),
        ];
        if let Some(extra) = cfg.get("env").and_then(Value::as_object) {
            for (key, value) in extra {
                if let Some(text) = value.as_str() {
                    env.push((key.clone(), text.to_string()));
                }
            }
        }

        let labels = [
            (protocol::LABEL_MANAGED.to_string(), "true".to_string()),
            (
                protocol::LABEL_SANDBOX_ID.to_string(),
                record.sandbox_id.to_string(),
            ),
            (protocol::LABEL_USER_ID.to_string(), record.user_id.clone()),
        ]
        .into_iter()
        .collect();

        ContainerSpec {
            name: format!("warden-{}", record.sandbox_id),
            image,
            env,
            labels,
            limits,
        }
    }

    pub async fn get_sandbox(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
    ) -> Result<SandboxRecord, OrchestratorError> {
        self.owned(sandbox_id, user_id).await
    }

    pub async fn list_sandboxes(
        &self,
        user_id: &str,
    ) -> Result<Vec<SandboxRecord>, OrchestratorError> {
        validate_user_id(user_id)?;
        Ok(self.store.list(Some(user_id)).await?)
    }

    /// Runs a command inside the sandbox. Concurrent execs against the same
    /// sandbox are serialized, so cwd updates are linearizable; execs against
    /// different sandboxes proceed independently.
    #[instrument(skip(self, request), fields(sandbox_id = %sandbox_id))]
    pub async fn exec_in_sandbox(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
        request: ExecRequest,
    ) -> Result<ExecResult, OrchestratorError> {
        if request.command.is_empty() || request.command.len() > MAX_COMMAND_BYTES {
            return Err(OrchestratorError::Validation(format!(
                "command must be between 1 and {MAX_COMMAND_BYTES} bytes"
            )));
        }
        if let Some(cwd) = request.cwd.as_deref() {
            if !cwd.starts_with('/') {
                return Err(OrchestratorError::Validation(
                    "cwd must be an absolute path".to_string(),
                ));
            }
        }

        let handle = self.locks.handle(sandbox_id);
        let _guard = handle.lock().await;

        let record = self.owned(sandbox_id, user_id).await?;
        if !record.status.accepts_exec() {
            return Err(OrchestratorError::InvalidState {
                sandbox_id,
                status: record.status,
            });
        }
        let container_id = record.container_id.clone().ok_or_else(|| {
            OrchestratorError::Internal(anyhow::anyhow!(
                "sandbox {sandbox_id} is {} without a container",
                record.status
            ))
        })?;

        let cwd = request.cwd.unwrap_or_else(|| record.cwd.clone());
        let deadline = request.timeout.unwrap_or(self.config.exec_timeout);

        let output = match self
            .driver
            .exec(&container_id, &request.command, &cwd, deadline)
            .await
        {
            Ok(output) => output,
            Err(DriverError::NotFound(_)) => {
                // The container vanished underneath a live record. Converge
                // the registry now instead of waiting for the next
                // reconciliation pass, and refuse the exec.
                warn!(sandbox_id = %sandbox_id, "container gone during exec; marking sandbox stopped");
                let stopped = self.force_stop(sandbox_id, StopReason::Error).await?;
                return Err(OrchestratorError::InvalidState {
                    sandbox_id,
                    status: stopped.status,
                });
            }
            Err(err) => return Err(map_driver(err)),
        };

        let now = Utc::now();
        let mut patch = SandboxPatch {
            last_heartbeat_at: Some(now),
            ..SandboxPatch::default()
        };
        if record.status == SandboxStatus::Ready {
            patch.status = Some(SandboxStatus::Running);
        }
        // Failed commands leave the tracked cwd alone.
        if output.exit_code == Some(0) {
            if let Some(new_cwd) = output.new_cwd.as_deref() {
                if new_cwd != record.cwd {
                    patch.cwd = Some(new_cwd.to_string());
                }
            }
        }
        patch.config = Some(append_exec_audit(
            &record.config,
            &request.command,
            output.exit_code,
            output.stdout.len(),
            output.stderr.len(),
            now,
        ));

        let updated = self.store.update(sandbox_id, patch).await?;

        Ok(ExecResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            cwd: updated.cwd,
        })
    }

    pub async fn heartbeat(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
    ) -> Result<SandboxRecord, OrchestratorError> {
        let handle = self.locks.handle(sandbox_id);
        let _guard = handle.lock().await;

        let record = self.owned(sandbox_id, user_id).await?;
        if !record.status.is_live() {
            return Err(OrchestratorError::InvalidState {
                sandbox_id,
                status: record.status,
            });
        }
        Ok(self
            .store
            .update(
                sandbox_id,
                SandboxPatch {
                    last_heartbeat_at: Some(Utc::now()),
                    ..SandboxPatch::default()
                },
            )
            .await?)
    }

    /// Agent-signalled completion. Recorded into the config blob; the
    /// sandbox keeps running until someone destroys it.
    pub async fn mark_complete(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
        result: Option<Value>,
    ) -> Result<SandboxRecord, OrchestratorError> {
        self.annotate(sandbox_id, user_id, "completion", json!({
            "result": result,
            "recorded_at": Utc::now(),
        }))
        .await
    }

    /// Agent-signalled error. Does not transition the record to `failed`;
    /// the sandbox is still alive and inspectable.
    pub async fn mark_error(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
        message: String,
        details: Option<Value>,
    ) -> Result<SandboxRecord, OrchestratorError> {
        self.annotate(sandbox_id, user_id, "last_error", json!({
            "message": message,
            "details": details,
            "recorded_at": Utc::now(),
        }))
        .await
    }

    async fn annotate(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
        key: &str,
        value: Value,
    ) -> Result<SandboxRecord, OrchestratorError> {
        let handle = self.locks.handle(sandbox_id);
        let _guard = handle.lock().await;

        let record = self.owned(sandbox_id, user_id).await?;
        if !record.status.is_live() {
            return Err(OrchestratorError::InvalidState {
                sandbox_id,
                status: record.status,
            });
        }

        let mut config = record.config.clone();
        if let Some(map) = config.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        Ok(self
            .store
            .update(
                sandbox_id,
                SandboxPatch {
                    config: Some(config),
                    ..SandboxPatch::default()
                },
            )
            .await?)
    }

    /// Tears the sandbox down and records why. Idempotent: a record that is
    /// already terminal comes back unchanged, keeping the first call's stop
    /// reason. `user_id: None` is the internal path used by the background
    /// loops.
    #[instrument(skip(self), fields(sandbox_id = %sandbox_id, graceful = graceful, reason = %reason))]
    pub async fn destroy_sandbox(
        &self,
        sandbox_id: Uuid,
        user_id: Option<&str>,
        graceful: bool,
        reason: StopReason,
    ) -> Result<SandboxRecord, OrchestratorError> {
        let handle = self.locks.handle(sandbox_id);
        let guard = handle.lock().await;

        let record = match user_id {
            Some(user) => self.owned(sandbox_id, user).await?,
            None => self.store.get(sandbox_id).await?,
        };

        if record.status.is_terminal() {
            drop(guard);
            self.locks.prune(sandbox_id);
            return Ok(record);
        }

        let mut current = record;
        // Lease expiry marks the lease dead before teardown so exec starts
        // refusing the moment the sweep claims the sandbox.
        if reason == StopReason::Expired && current.status.accepts_exec() {
            current = self
                .store
                .update(sandbox_id, SandboxPatch::status(SandboxStatus::Expired))
                .await?;
        }
        if current.status != SandboxStatus::ShuttingDown {
            current = self
                .store
                .update(
                    sandbox_id,
                    SandboxPatch::status(SandboxStatus::ShuttingDown),
                )
                .await?;
        }

        if let Some(container_id) = current.container_id.clone() {
            if graceful {
                // Lets the in-container shutdown protocol (hot-sync up,
                // cold unmount) run before the force-remove below.
                if let Err(err) = self
                    .driver
                    .stop(&container_id, self.config.shutdown_timeout)
                    .await
                {
                    warn!(sandbox_id = %sandbox_id, error = %err, "graceful stop failed; forcing removal");
                }
            }
            self.driver.remove(&container_id).await.map_err(map_driver)?;
        }

        let stopped = self
            .store
            .update(
                sandbox_id,
                SandboxPatch {
                    status: Some(SandboxStatus::Stopped),
                    stopped_at: Some(Utc::now()),
                    stop_reason: Some(reason),
                    ..SandboxPatch::default()
                },
            )
            .await?;

        drop(guard);
        self.locks.prune(sandbox_id);
        info!(sandbox_id = %sandbox_id, reason = %reason, "sandbox stopped");
        Ok(stopped)
    }

    /// One expiry sweep: gracefully destroys every sandbox whose lease
    /// deadline has passed. Returns how many were reaped.
    pub async fn expire_once(&self) -> usize {
        let expired = match self.store.list_expired(Utc::now()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "expiry sweep could not list leases");
                return 0;
            }
        };

        let mut reaped = 0;
        for record in expired {
            match self
                .destroy_sandbox(record.sandbox_id, None, true, StopReason::Expired)
                .await
            {
                Ok(_) => reaped += 1,
                Err(err) => {
                    warn!(sandbox_id = %record.sandbox_id, error = %err, "failed to expire sandbox")
                }
            }
        }
        if reaped > 0 {
            info!(reaped, "expiry sweep finished");
        }
        reaped
    }

    /// One reconciliation pass between the registry and the engine.
    ///
    /// Records whose container died or disappeared are marked stopped with
    /// `stop_reason = error`. Live labelled containers no record references
    /// are logged at WARN and left in place: destroying them could race an
    /// in-flight creation on another instance.
    pub async fn reconcile_once(&self) {
        let records = match self.store.list(None).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "reconciliation could not list records");
                return;
            }
        };

        for record in records.iter().filter(|record| record.status.is_live()) {
            let Some(container_id) = record.container_id.as_deref() else {
                continue;
            };
            if self.container_is_gone(container_id).await != Some(true) {
                continue;
            }

            // Re-verify under the sandbox lock: a destroy may have finished,
            // or an in-flight provisioning (which holds the lock) may have
            // brought the container up since the observation above.
            let handle = self.locks.handle(record.sandbox_id);
            let guard = handle.lock().await;
            if let Ok(current) = self.store.get(record.sandbox_id).await {
                let gone_container = match current.container_id.clone() {
                    Some(cid) if current.status.is_live() => {
                        if self.container_is_gone(&cid).await == Some(true) {
                            Some(cid)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(cid) = gone_container {
                    warn!(
                        sandbox_id = %record.sandbox_id,
                        container = %cid,
                        "live record lost its container; marking stopped"
                    );
                    // A dead-but-present container is still engine garbage.
                    let _ = self.driver.remove(&cid).await;
                    if let Err(err) = self.force_stop(record.sandbox_id, StopReason::Error).await
                    {
                        warn!(sandbox_id = %record.sandbox_id, error = %err, "drift recovery failed");
                    }
                }
            }
            drop(guard);
            self.locks.prune(record.sandbox_id);
        }

        let live = match self.driver.list_labelled().await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(error = %err, "reconciliation could not list containers");
                return;
            }
        };

        let referenced: HashSet<Uuid> = records
            .iter()
            .filter(|record| record.status.is_live())
            .map(|record| record.sandbox_id)
            .collect();

        for container in live {
            let known = container
                .labels
                .get(protocol::LABEL_SANDBOX_ID)
                .and_then(|raw| Uuid::parse_str(raw).ok())
                .map(|id| referenced.contains(&id))
                .unwrap_or(false);
            if !known {
                warn!(
                    container = %container.container_id,
                    "live sandbox container not referenced by any active record; leaving in place"
                );
            }
        }
    }

    /// `Some(true)` when the container no longer backs a live sandbox: it
    /// exited, died, was removed, or was never started. `None` when the
    /// engine could not answer; drift recovery skips those rather than
    /// guessing.
    async fn container_is_gone(&self, container_id: &str) -> Option<bool> {
        match self.driver.inspect(container_id).await {
            Ok(status) => Some(matches!(
                status.state,
                ContainerState::Exited | ContainerState::Dead | ContainerState::Created
            )),
            Err(DriverError::NotFound(_)) => Some(true),
            Err(err) => {
                warn!(container = container_id, error = %err, "reconciliation inspect failed");
                None
            }
        }
    }

    /// Direct-to-stopped transition used when the backing container is
    /// already gone (drift recovery); there is nothing left to shut down
    /// gracefully.
    async fn force_stop(
        &self,
        sandbox_id: Uuid,
        reason: StopReason,
    ) -> Result<SandboxRecord, OrchestratorError> {
        Ok(self
            .store
            .update(
                sandbox_id,
                SandboxPatch {
                    status: Some(SandboxStatus::Stopped),
                    stopped_at: Some(Utc::now()),
                    stop_reason: Some(reason),
                    ..SandboxPatch::default()
                },
            )
            .await?)
    }

    async fn owned(
        &self,
        sandbox_id: Uuid,
        user_id: &str,
    ) -> Result<SandboxRecord, OrchestratorError> {
        let record = self.store.get(sandbox_id).await?;
        if record.user_id != user_id {
            // 404, not 403: a cross-user probe must not learn the id exists.
            return Err(OrchestratorError::NotFound(sandbox_id));
        }
        Ok(record)
    }
}

fn append_exec_audit(
    config: &Value,
    command: &str,
    exit_code: Option<i64>,
    stdout_bytes: usize,
    stderr_bytes: usize,
    at: chrono::DateTime<Utc>,
) -> Value {
    let mut config = config.clone();
    let entry = json!({
        "at": at,
        "command": command.chars().take(256).collect::<String>(),
        "exit_code": exit_code,
        "stdout_bytes": stdout_bytes,
        "stderr_bytes": stderr_bytes,
    });

    if let Some(map) = config.as_object_mut() {
        let ring = map
            .entry("last_execs")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(entries) = ring.as_array_mut() {
            entries.push(entry);
            if entries.len() > EXEC_AUDIT_RING {
                let overflow = entries.len() - EXEC_AUDIT_RING;
                entries.drain(..overflow);
            }
        }
    }
    config
}
