//! Validation of the environment contract the orchestrator passes to every
//! sandbox container. Startup aborts (non-zero) if anything is missing or
//! malformed, which the orchestrator's readiness poll reports as a failed
//! provisioning.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use warden_store::protocol;

const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AgentEnv {
    pub sandbox_id: String,
    pub user_id: String,
    pub bucket: String,
    pub region: String,
    pub hot_path: PathBuf,
    pub cold_path: PathBuf,
    pub shutdown_timeout: Duration,
}

impl AgentEnv {
    pub fn from_process_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sandbox_id = required(&lookup, protocol::ENV_SANDBOX_ID)?;
        let user_id = required(&lookup, protocol::ENV_USER_ID)?;
        let bucket = required(&lookup, protocol::ENV_S3_BUCKET)?;
        let region = required(&lookup, protocol::ENV_S3_REGION)?;
        let hot_path = absolute(&lookup, protocol::ENV_HOT_PATH)?;
        let cold_path = absolute(&lookup, protocol::ENV_COLD_PATH)?;

        let shutdown_timeout = match lookup(protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS) {
            Some(raw) => {
                let seconds: u64 = raw.parse().map_err(|_| {
                    anyhow::anyhow!(
                        "{} must be a number of seconds, got '{raw}'",
                        protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS
                    )
                })?;
                Duration::from_secs(seconds)
            }
            None => Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        };

        Ok(Self {
            sandbox_id,
            user_id,
            bucket,
            region,
            hot_path,
            cold_path,
            shutdown_timeout,
        })
    }

    pub fn hot_prefix(&self) -> String {
        protocol::hot_prefix(&self.user_id)
    }

    pub fn cold_prefix(&self) -> String {
        protocol::cold_prefix(&self.user_id)
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("required environment variable {key} is missing or empty"),
    }
}

fn absolute(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<PathBuf> {
    let value = required(lookup, key)?;
    if !value.starts_with('/') {
        bail!("{key} must be an absolute path, got '{value}'");
    }
    Ok(PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (protocol::ENV_SANDBOX_ID, "6a3a0c6e-0000-4000-8000-000000000000"),
            (protocol::ENV_USER_ID, "u-alice"),
            (protocol::ENV_S3_BUCKET, "warden-data"),
            (protocol::ENV_S3_REGION, "us-east-1"),
            (protocol::ENV_HOT_PATH, "/home/agent"),
            (protocol::ENV_COLD_PATH, "/home/agent/cold"),
            (protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS, "30"),
        ])
    }

    fn lookup_in(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Option<String> {
        move |key| map.get(key).map(|value| value.to_string())
    }

    #[test]
    fn full_environment_parses() {
        let env = AgentEnv::from_lookup(lookup_in(full_env())).unwrap();
        assert_eq!(env.user_id, "u-alice");
        assert_eq!(env.hot_prefix(), "users/u-alice/hot/");
        assert_eq!(env.cold_prefix(), "users/u-alice/cold/");
        assert_eq!(env.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn each_required_variable_is_enforced() {
        for key in [
            protocol::ENV_SANDBOX_ID,
            protocol::ENV_USER_ID,
            protocol::ENV_S3_BUCKET,
            protocol::ENV_S3_REGION,
            protocol::ENV_HOT_PATH,
            protocol::ENV_COLD_PATH,
        ] {
            let mut env = full_env();
            env.remove(key);
            let result = AgentEnv::from_lookup(lookup_in(env));
            assert!(result.is_err(), "missing {key} must abort startup");
        }
    }

    #[test]
    fn relative_mount_paths_are_rejected() {
        let mut env = full_env();
        env.insert(protocol::ENV_HOT_PATH, "home/agent");
        assert!(AgentEnv::from_lookup(lookup_in(env)).is_err());
    }

    #[test]
    fn shutdown_timeout_defaults_and_rejects_garbage() {
        let mut env = full_env();
        env.remove(protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS);
        let parsed = AgentEnv::from_lookup(lookup_in(env)).unwrap();
        assert_eq!(parsed.shutdown_timeout, Duration::from_secs(30));

        let mut env = full_env();
        env.insert(protocol::ENV_SHUTDOWN_TIMEOUT_SECONDS, "soon");
        assert!(AgentEnv::from_lookup(lookup_in(env)).is_err());
    }
}
