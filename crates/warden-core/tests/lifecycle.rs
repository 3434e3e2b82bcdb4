//! Lifecycle tests driving the orchestrator end to end against the memory
//! store and an in-process fake engine. The fake understands just enough
//! shell (`cd`, `pwd`, `echo`, `false`, chained with `&&`) to exercise the
//! cwd-tracking contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use warden_core::driver::{
    ContainerDriver, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    DriverError, ExecOutput,
};
use warden_core::{
    CreateSandboxRequest, ExecRequest, Orchestrator, OrchestratorConfig, OrchestratorError,
};
use warden_store::memory::MemoryStore;
use warden_store::{protocol, SandboxPatch, SandboxStatus, SandboxStore, StopReason};

struct FakeContainer {
    labels: HashMap<String, String>,
    state: ContainerState,
    ready: bool,
}

#[derive(Default)]
struct FakeDriver {
    containers: Mutex<HashMap<String, FakeContainer>>,
    counter: AtomicU64,
    /// When false, started containers never write the readiness marker.
    ready_on_start: bool,
    fail_create: bool,
}

impl FakeDriver {
    fn new() -> Self {
        Self {
            ready_on_start: true,
            ..Self::default()
        }
    }

    fn failing_create() -> Self {
        Self {
            ready_on_start: true,
            fail_create: true,
            ..Self::default()
        }
    }

    fn never_ready() -> Self {
        Self {
            ready_on_start: false,
            ..Self::default()
        }
    }

    fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Simulates the engine losing a container behind the registry's back.
    fn kill(&self, container_id: &str) {
        self.containers.lock().remove(container_id);
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        if self.fail_create {
            return Err(DriverError::Engine(anyhow::anyhow!("image pull failed")));
        }
        let id = format!("fc-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                state: ContainerState::Created,
                ready: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        container.state = ContainerState::Running;
        container.ready = self.ready_on_start;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        let containers = self.containers.lock();
        let container = containers
            .get(container_id)
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        Ok(ContainerStatus {
            state: container.state,
            exit_code: None,
            started_at: None,
        })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        cwd: &str,
        _deadline: Duration,
    ) -> Result<ExecOutput, DriverError> {
        let ready = {
            let containers = self.containers.lock();
            let container = containers
                .get(container_id)
                .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
            if container.state != ContainerState::Running {
                return Err(DriverError::NotFound(container_id.to_string()));
            }
            container.ready
        };

        if command == format!("test -f {}", protocol::READY_MARKER_PATH) {
            return Ok(ExecOutput {
                exit_code: Some(if ready { 0 } else { 1 }),
                stdout: String::new(),
                stderr: String::new(),
                new_cwd: Some(cwd.to_string()),
            });
        }

        let mut dir = cwd.to_string();
        let mut stdout = String::new();
        let mut exit_code = 0;
        for step in command.split("&&").map(str::trim) {
            match step {
                "false" => {
                    exit_code = 1;
                    break;
                }
                "pwd" => stdout.push_str(&format!("{dir}\n")),
                _ if step.starts_with("cd ") => {
                    dir = step.trim_start_matches("cd ").trim().to_string();
                }
                _ if step.starts_with("echo ") => {
                    stdout.push_str(&format!("{}\n", step.trim_start_matches("echo ")));
                }
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_code: Some(exit_code),
            stdout,
            stderr: String::new(),
            new_cwd: Some(dir),
        })
    }

    async fn stop(&self, container_id: &str, _timeout: Duration) -> Result<(), DriverError> {
        if let Some(container) = self.containers.lock().get_mut(container_id) {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        self.containers.lock().remove(container_id);
        Ok(())
    }

    async fn list_labelled(&self) -> Result<Vec<ContainerSummary>, DriverError> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|(_, container)| container.state == ContainerState::Running)
            .map(|(id, container)| ContainerSummary {
                container_id: id.clone(),
                labels: container.labels.clone(),
            })
            .collect())
    }
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new("warden-sandbox:latest", "warden-test", "us-east-1");
    config.ready_timeout = Duration::from_secs(2);
    config.ready_poll_interval = Duration::from_millis(5);
    config
}

fn setup_with(driver: FakeDriver) -> (Arc<Orchestrator>, Arc<FakeDriver>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(driver);
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        driver.clone(),
        test_config(),
    ));
    (orchestrator, driver, store)
}

fn setup() -> (Arc<Orchestrator>, Arc<FakeDriver>, Arc<MemoryStore>) {
    setup_with(FakeDriver::new())
}

fn create_request(user: &str) -> CreateSandboxRequest {
    CreateSandboxRequest {
        user_id: user.to_string(),
        ttl_seconds: Some(60),
        config: None,
    }
}

fn exec(command: &str) -> ExecRequest {
    ExecRequest {
        command: command.to_string(),
        cwd: None,
        timeout: None,
    }
}

#[tokio::test]
async fn create_exec_destroy_happy_path() {
    let (orchestrator, driver, _store) = setup();

    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();
    assert_eq!(record.status, SandboxStatus::Ready);
    assert!(record.expires_at.is_some());
    assert_eq!(record.cwd, "/home/agent");
    assert_eq!(driver.container_count(), 1);

    let result = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo hi"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.cwd, "/home/agent");

    // First exec moves the record to running and stamps a heartbeat.
    let after_exec = orchestrator
        .get_sandbox(record.sandbox_id, "u-alice")
        .await
        .unwrap();
    assert_eq!(after_exec.status, SandboxStatus::Running);
    assert!(after_exec.last_heartbeat_at.is_some());

    let stopped = orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-alice"), true, StopReason::UserRequested)
        .await
        .unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::UserRequested));
    assert!(stopped.stopped_at.is_some());
    assert_eq!(driver.container_count(), 0);
}

#[tokio::test]
async fn cwd_persists_across_execs() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let first = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("mkdir -p /tmp/x && cd /tmp/x"))
        .await
        .unwrap();
    assert_eq!(first.exit_code, Some(0));
    assert_eq!(first.cwd, "/tmp/x");

    let second = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("pwd"))
        .await
        .unwrap();
    assert_eq!(second.stdout, "/tmp/x\n");
    assert_eq!(second.cwd, "/tmp/x");
}

#[tokio::test]
async fn failed_command_does_not_move_cwd() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let result = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("cd /tmp/x && false"))
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.cwd, "/home/agent", "failed exec must not move the cwd");

    let follow_up = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("pwd"))
        .await
        .unwrap();
    assert_eq!(follow_up.stdout, "/home/agent\n");
}

#[tokio::test]
async fn cwd_override_applies_for_the_call_and_persists_on_success() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let result = orchestrator
        .exec_in_sandbox(
            record.sandbox_id,
            "u-alice",
            ExecRequest {
                command: "pwd".to_string(),
                cwd: Some("/opt".to_string()),
                timeout: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "/opt\n");
    assert_eq!(result.cwd, "/opt");
}

#[tokio::test]
async fn exec_validation_boundaries() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let empty = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec(""))
        .await;
    assert!(matches!(empty, Err(OrchestratorError::Validation(_))));

    let oversized = "x".repeat(warden_core::MAX_COMMAND_BYTES + 1);
    let too_long = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec(&oversized))
        .await;
    assert!(matches!(too_long, Err(OrchestratorError::Validation(_))));

    let at_limit = "x".repeat(warden_core::MAX_COMMAND_BYTES);
    let accepted = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec(&at_limit))
        .await;
    assert!(accepted.is_ok(), "command at the policy maximum must run");

    let relative = orchestrator
        .exec_in_sandbox(
            record.sandbox_id,
            "u-alice",
            ExecRequest {
                command: "pwd".to_string(),
                cwd: Some("not-absolute".to_string()),
                timeout: None,
            },
        )
        .await;
    assert!(matches!(relative, Err(OrchestratorError::Validation(_))));
}

#[tokio::test]
async fn exec_after_destroy_is_invalid_state() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();
    orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-alice"), false, StopReason::UserRequested)
        .await
        .unwrap();

    let result = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo hi"))
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::InvalidState { status: SandboxStatus::Stopped, .. })
    ));
}

#[tokio::test]
async fn destroy_is_idempotent_and_keeps_first_reason() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let first = orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-alice"), true, StopReason::UserRequested)
        .await
        .unwrap();
    assert_eq!(first.stop_reason, Some(StopReason::UserRequested));

    let second = orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-alice"), true, StopReason::Admin)
        .await
        .unwrap();
    assert_eq!(second.status, SandboxStatus::Stopped);
    assert_eq!(
        second.stop_reason,
        Some(StopReason::UserRequested),
        "second destroy must not overwrite the first stop reason"
    );
}

#[tokio::test]
async fn ownership_misses_read_as_not_found() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let as_bob = orchestrator.get_sandbox(record.sandbox_id, "u-bob").await;
    assert!(matches!(as_bob, Err(OrchestratorError::NotFound(_))));

    let exec_as_bob = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-bob", exec("echo hi"))
        .await;
    assert!(matches!(exec_as_bob, Err(OrchestratorError::NotFound(_))));

    let destroy_as_bob = orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-bob"), false, StopReason::UserRequested)
        .await;
    assert!(matches!(destroy_as_bob, Err(OrchestratorError::NotFound(_))));

    let bob_list = orchestrator.list_sandboxes("u-bob").await.unwrap();
    assert!(bob_list.is_empty());
    let alice_list = orchestrator.list_sandboxes("u-alice").await.unwrap();
    assert_eq!(alice_list.len(), 1);
}

#[tokio::test]
async fn create_failure_marks_record_failed_and_leaves_no_container() {
    let (orchestrator, driver, store) = setup_with(FakeDriver::failing_create());

    let err = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Internal(_)));
    assert_eq!(driver.container_count(), 0);

    let records = store.list(Some("u-alice")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SandboxStatus::Failed);
    assert_eq!(records[0].stop_reason, Some(StopReason::Error));
}

#[tokio::test]
async fn readiness_timeout_marks_record_failed() {
    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(FakeDriver::never_ready());
    let mut config = test_config();
    config.ready_timeout = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(store.clone(), driver.clone(), config);

    let err = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Timeout(_)));

    let records = store.list(Some("u-alice")).await.unwrap();
    assert_eq!(records[0].status, SandboxStatus::Failed);
    assert_eq!(driver.container_count(), 0, "failed sandbox container must be removed");
}

#[tokio::test]
async fn expiry_sweep_reaps_lapsed_leases() {
    let (orchestrator, _driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    // Backdate the lease instead of sleeping it out.
    store
        .update(
            record.sandbox_id,
            SandboxPatch {
                expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                ..SandboxPatch::default()
            },
        )
        .await
        .unwrap();

    let reaped = orchestrator.expire_once().await;
    assert_eq!(reaped, 1);

    let stopped = store.get(record.sandbox_id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Expired));

    let exec_after = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo hi"))
        .await;
    assert!(matches!(
        exec_after,
        Err(OrchestratorError::InvalidState { .. })
    ));

    // A second sweep finds nothing.
    assert_eq!(orchestrator.expire_once().await, 0);
}

#[tokio::test]
async fn lease_is_not_reaped_before_its_deadline() {
    let (orchestrator, _driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    assert_eq!(orchestrator.expire_once().await, 0);
    let current = store.get(record.sandbox_id).await.unwrap();
    assert_eq!(current.status, SandboxStatus::Ready);
}

#[tokio::test]
async fn reconcile_stops_records_whose_container_vanished() {
    let (orchestrator, driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    driver.kill(record.container_id.as_deref().unwrap());
    orchestrator.reconcile_once().await;

    let stopped = store.get(record.sandbox_id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Error));

    let exec_after = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo hi"))
        .await;
    assert!(matches!(
        exec_after,
        Err(OrchestratorError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn reconcile_leaves_healthy_sandboxes_alone() {
    let (orchestrator, _driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    orchestrator.reconcile_once().await;

    let current = store.get(record.sandbox_id).await.unwrap();
    assert_eq!(current.status, SandboxStatus::Ready);
}

#[tokio::test]
async fn exec_against_vanished_container_converges_record() {
    let (orchestrator, driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    driver.kill(record.container_id.as_deref().unwrap());

    let result = orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo hi"))
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::InvalidState { status: SandboxStatus::Stopped, .. })
    ));

    let stopped = store.get(record.sandbox_id).await.unwrap();
    assert_eq!(stopped.status, SandboxStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Error));
}

#[tokio::test]
async fn concurrent_execs_serialize_cwd_updates() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let orchestrator = orchestrator.clone();
        let sandbox_id = record.sandbox_id;
        tasks.push(tokio::spawn(async move {
            orchestrator
                .exec_in_sandbox(sandbox_id, "u-alice", exec(&format!("cd /d{i}")))
                .await
        }));
    }
    let mut returned = Vec::new();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.exit_code, Some(0));
        returned.push(result.cwd);
    }

    let final_cwd = orchestrator
        .get_sandbox(record.sandbox_id, "u-alice")
        .await
        .unwrap()
        .cwd;
    assert!(
        (0..8).any(|i| final_cwd == format!("/d{i}")),
        "final cwd {final_cwd} must be one of the contenders"
    );
    assert!(returned.contains(&final_cwd));
}

#[tokio::test]
async fn at_most_one_container_per_sandbox() {
    let (orchestrator, driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let matching = driver
        .list_labelled()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| {
            c.labels.get(protocol::LABEL_SANDBOX_ID).map(String::as_str)
                == Some(record.sandbox_id.to_string().as_str())
        })
        .count();
    assert_eq!(matching, 1);

    orchestrator
        .destroy_sandbox(record.sandbox_id, Some("u-alice"), false, StopReason::UserRequested)
        .await
        .unwrap();
    assert_eq!(driver.container_count(), 0);
}

#[tokio::test]
async fn heartbeat_and_completion_annotations() {
    let (orchestrator, _driver, _store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    let beaten = orchestrator
        .heartbeat(record.sandbox_id, "u-alice")
        .await
        .unwrap();
    assert!(beaten.last_heartbeat_at.is_some());

    let completed = orchestrator
        .mark_complete(record.sandbox_id, "u-alice", Some(json!({"answer": 42})))
        .await
        .unwrap();
    assert_eq!(completed.config["completion"]["result"]["answer"], 42);
    assert_eq!(completed.status, SandboxStatus::Ready, "completion must not stop the sandbox");

    let errored = orchestrator
        .mark_error(
            record.sandbox_id,
            "u-alice",
            "tool crashed".to_string(),
            Some(json!({"code": 137})),
        )
        .await
        .unwrap();
    assert_eq!(errored.config["last_error"]["message"], "tool crashed");
    assert_ne!(errored.status, SandboxStatus::Failed, "agent errors must not fail the record");
}

#[tokio::test]
async fn create_rejects_bad_user_ids() {
    let (orchestrator, _driver, _store) = setup();
    for bad in ["", "u/alice", "u alice", &"a".repeat(256)] {
        let result = orchestrator
            .create_sandbox(CreateSandboxRequest {
                user_id: bad.to_string(),
                ttl_seconds: None,
                config: None,
            })
            .await;
        assert!(
            matches!(result, Err(OrchestratorError::Validation(_))),
            "user id {bad:?} must be rejected"
        );
    }
}

#[tokio::test]
async fn exec_audit_ring_records_commands() {
    let (orchestrator, _driver, store) = setup();
    let record = orchestrator
        .create_sandbox(create_request("u-alice"))
        .await
        .unwrap();

    orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo one"))
        .await
        .unwrap();
    orchestrator
        .exec_in_sandbox(record.sandbox_id, "u-alice", exec("echo two"))
        .await
        .unwrap();

    let current = store.get(record.sandbox_id).await.unwrap();
    let ring = current.config["last_execs"].as_array().unwrap();
    assert_eq!(ring.len(), 2);
    assert_eq!(ring[0]["command"], "echo one");
    assert_eq!(ring[1]["command"], "echo two");
    assert_eq!(ring[1]["exit_code"], 0);
}
