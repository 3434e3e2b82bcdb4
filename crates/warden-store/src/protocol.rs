//! Constants shared between the control plane and the in-container agent.
//!
//! The orchestrator passes the environment variables below to every
//! container it creates; the agent validates them during startup. The
//! per-user object-store layout keeps the hot and cold tiers under
//! sibling prefixes so a single bucket serves all users.

/// Environment variables required inside every sandbox (spec'd contract).
pub const ENV_SANDBOX_ID: &str = "SANDBOX_ID";
pub const ENV_USER_ID: &str = "USER_ID";
pub const ENV_S3_BUCKET: &str = "S3_BUCKET";
pub const ENV_S3_REGION: &str = "S3_REGION";
pub const ENV_HOT_PATH: &str = "HOT_PATH";
pub const ENV_COLD_PATH: &str = "COLD_PATH";
pub const ENV_SHUTDOWN_TIMEOUT_SECONDS: &str = "SHUTDOWN_TIMEOUT_SECONDS";

/// Default mount points inside the container.
pub const DEFAULT_HOT_PATH: &str = "/home/agent";
pub const DEFAULT_COLD_PATH: &str = "/home/agent/cold";

/// Written by the agent once startup completed; polled by the orchestrator.
pub const READY_MARKER_PATH: &str = "/run/warden/ready";

/// Container labels the orchestrator stamps on everything it creates.
/// `LABEL_MANAGED` marks a container as ours for reconciliation.
pub const LABEL_MANAGED: &str = "warden.managed";
pub const LABEL_SANDBOX_ID: &str = "warden.sandbox-id";
pub const LABEL_USER_ID: &str = "warden.user-id";

/// Object-store prefix for a user's eagerly-synced working set.
pub fn hot_prefix(user_id: &str) -> String {
    format!("users/{user_id}/hot/")
}

/// Object-store prefix for a user's lazily-projected archive.
pub fn cold_prefix(user_id: &str) -> String {
    format!("users/{user_id}/cold/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_per_user_and_disjoint() {
        assert_eq!(hot_prefix("u-alice"), "users/u-alice/hot/");
        assert_eq!(cold_prefix("u-alice"), "users/u-alice/cold/");
        assert_ne!(hot_prefix("u-alice"), hot_prefix("u-bob"));
    }
}
