//! Orchestrator-side view of the object store.
//!
//! The control plane never moves object data itself; that happens inside the
//! sandbox during the lifecycle protocol. Here we only prove the configured
//! bucket is reachable before serving traffic, and hand the per-user prefix
//! layout to new containers through their environment.

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::Client;
use tracing::info;

pub struct ObjectStoreGateway {
    client: Client,
    bucket: String,
    region: String,
}

impl ObjectStoreGateway {
    pub async fn connect(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let region = region.into();
        let shared = aws_config::from_env()
            .region(Region::new(region.clone()))
            .load()
            .await;
        Self {
            client: Client::new(&shared),
            bucket,
            region,
        }
    }

    /// Fail-fast probe run once at startup. `HeadBucket` also proves
    /// ownership: a bucket that exists under someone else's account comes
    /// back 403, not 200.
    pub async fn verify_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("bucket '{}' is not reachable", self.bucket))?;
        info!(bucket = %self.bucket, region = %self.region, "object store bucket verified");
        Ok(())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}
