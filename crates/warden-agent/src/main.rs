//! In-container lifecycle agent.
//!
//! PID 1 of every sandbox image. `warden-agent startup` validates the
//! environment contract, syncs the hot tier down, mounts the cold tier,
//! writes the readiness marker the orchestrator polls for, and then blocks
//! until a termination signal arrives, at which point the shutdown sequence
//! (hot-sync up, cold unmount) runs under the configured deadline.
//! `warden-agent shutdown` runs the shutdown sequence standalone.

mod coldmount;
mod env;
mod hotsync;

use std::path::Path;

use anyhow::{bail, Context, Result};
use aws_config::Region;
use aws_sdk_s3::Client;
use tokio::fs;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coldmount::ColdMount;
use env::AgentEnv;
use warden_store::protocol;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "startup".to_string());
    match mode.as_str() {
        "startup" => startup().await,
        "shutdown" => {
            let agent_env = AgentEnv::from_process_env()?;
            let client = s3_client(&agent_env).await;
            remove_ready_marker().await;
            let cold = ColdMount::assume_mounted(&agent_env.cold_path);
            shutdown_sequence(&client, &agent_env, &cold).await
        }
        other => bail!("unknown mode '{other}' (expected 'startup' or 'shutdown')"),
    }
}

async fn startup() -> Result<()> {
    let agent_env = AgentEnv::from_process_env().context("environment contract violated")?;
    info!(
        sandbox_id = %agent_env.sandbox_id,
        user_id = %agent_env.user_id,
        "agent starting"
    );

    let client = s3_client(&agent_env).await;

    fs::create_dir_all(&agent_env.hot_path)
        .await
        .with_context(|| format!("creating {}", agent_env.hot_path.display()))?;

    let hot_prefix = agent_env.hot_prefix();
    hotsync::with_retries("hot-sync down", || {
        hotsync::sync_down(&client, &agent_env.bucket, &hot_prefix, &agent_env.hot_path)
    })
    .await?;

    let cold_prefix = agent_env.cold_prefix();
    let cold = ColdMount::mount(&agent_env.bucket, &cold_prefix, &agent_env.cold_path).await;

    prepare_profile(&agent_env).await?;
    write_ready_marker().await?;
    info!("agent ready");

    wait_for_termination().await;
    info!("termination signal received; running shutdown sequence");

    remove_ready_marker().await;
    match tokio::time::timeout(
        agent_env.shutdown_timeout,
        shutdown_sequence(&client, &agent_env, &cold),
    )
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!(error = %err, "shutdown sequence failed");
            Err(err)
        }
        Err(_) => {
            error!("shutdown sequence exceeded its deadline");
            bail!("shutdown deadline exceeded")
        }
    }
}

/// Hot-sync up, then best-effort cold unmount. Data written strictly during
/// a hard crash is lost by design; this path only covers orderly stops.
async fn shutdown_sequence(client: &Client, agent_env: &AgentEnv, cold: &ColdMount) -> Result<()> {
    let hot_prefix = agent_env.hot_prefix();
    hotsync::with_retries("hot-sync up", || {
        hotsync::sync_up(
            client,
            &agent_env.bucket,
            &hot_prefix,
            &agent_env.hot_path,
            &agent_env.cold_path,
        )
    })
    .await?;

    cold.unmount().await;
    Ok(())
}

async fn s3_client(agent_env: &AgentEnv) -> Client {
    let config = aws_config::from_env()
        .region(Region::new(agent_env.region.clone()))
        .load()
        .await;
    Client::new(&config)
}

/// Environment file sourced by the agent user's shell profile; keeps the
/// sandbox identity available to interactive tooling.
async fn prepare_profile(agent_env: &AgentEnv) -> Result<()> {
    let profile = format!(
        "export {}={}\nexport {}={}\nexport {}={}\nexport {}={}\n",
        protocol::ENV_SANDBOX_ID,
        agent_env.sandbox_id,
        protocol::ENV_USER_ID,
        agent_env.user_id,
        protocol::ENV_HOT_PATH,
        agent_env.hot_path.display(),
        protocol::ENV_COLD_PATH,
        agent_env.cold_path.display(),
    );
    let path = agent_env.hot_path.join(".warden_profile");
    fs::write(&path, profile)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn write_ready_marker() -> Result<()> {
    let marker = Path::new(protocol::READY_MARKER_PATH);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(marker, chrono::Utc::now().to_rfc3339())
        .await
        .with_context(|| format!("writing readiness marker {}", marker.display()))
}

async fn remove_ready_marker() {
    if let Err(err) = fs::remove_file(protocol::READY_MARKER_PATH).await {
        warn!(error = %err, "could not remove readiness marker");
    }
}

async fn wait_for_termination() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
