//! Eager mirroring of the hot tier against the object store.
//!
//! `sync_down` runs during startup (bucket prefix -> hot directory),
//! `sync_up` during shutdown (hot directory -> bucket prefix). Both skip a
//! small fixed set of transient patterns and never descend into the cold
//! mount, which lives inside the hot directory by default.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bounded exponential back-off for a whole sync pass.
const SYNC_ATTEMPTS: u32 = 3;
const SYNC_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub files: u64,
    pub bytes: u64,
}

/// Retries a full sync pass; individual object failures fail the pass.
pub async fn with_retries<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = SYNC_BASE_DELAY;
    for attempt in 1..=SYNC_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < SYNC_ATTEMPTS => {
                warn!(attempt, error = %err, "{label} failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err.context(format!("{label} failed after {attempt} attempts"))),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

/// Mirrors `s3://{bucket}/{prefix}` into `dest`.
pub async fn sync_down(
    client: &Client,
    bucket: &str,
    prefix: &str,
    dest: &Path,
) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    let mut continuation: Option<String> = None;

    loop {
        let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
        if let Some(token) = &continuation {
            request = request.continuation_token(token);
        }
        let page = request
            .send()
            .await
            .with_context(|| format!("listing s3://{bucket}/{prefix}"))?;

        for object in page.contents() {
            let Some(key) = object.key() else { continue };
            let relative = key.strip_prefix(prefix).unwrap_or(key);
            if relative.is_empty() || relative.ends_with('/') || is_excluded(relative) {
                continue;
            }

            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            let response = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .with_context(|| format!("downloading s3://{bucket}/{key}"))?;
            let bytes = response.body.collect().await?.into_bytes();
            fs::write(&target, &bytes)
                .await
                .with_context(|| format!("writing {}", target.display()))?;

            stats.files += 1;
            stats.bytes += bytes.len() as u64;
            debug!(key, "downloaded");
        }

        if page.is_truncated() == Some(true) {
            continuation = page.next_continuation_token().map(str::to_string);
        } else {
            break;
        }
    }

    info!(files = stats.files, bytes = stats.bytes, "hot tier synced down");
    Ok(stats)
}

/// Mirrors `src` back into `s3://{bucket}/{prefix}`, skipping the subtree at
/// `skip` (the cold mount) and the transient patterns.
pub async fn sync_up(
    client: &Client,
    bucket: &str,
    prefix: &str,
    src: &Path,
    skip: &Path,
) -> Result<SyncStats> {
    let mut stats = SyncStats::default();

    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        entry.path() != skip && !component_excluded(entry.file_name().to_string_lossy().as_ref())
    });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walked entries live under the walk root");
        let key = format!("{prefix}{}", relative.to_string_lossy());

        let body = ByteStream::from_path(entry.path())
            .await
            .with_context(|| format!("reading {}", entry.path().display()))?;
        client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading s3://{bucket}/{key}"))?;

        stats.files += 1;
        stats.bytes += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        debug!(key, "uploaded");
    }

    info!(files = stats.files, bytes = stats.bytes, "hot tier synced up");
    Ok(stats)
}

/// Transient files that never cross the object-store boundary.
pub fn is_excluded(relative: &str) -> bool {
    relative.split('/').any(component_excluded)
}

fn component_excluded(component: &str) -> bool {
    component == ".DS_Store"
        || component == "__pycache__"
        || component == ".cache"
        || component.ends_with(".tmp")
        || component.ends_with(".swp")
        || component.ends_with('~')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns_are_excluded() {
        assert!(is_excluded("scratch.tmp"));
        assert!(is_excluded("notes/.draft.swp"));
        assert!(is_excluded("backup~"));
        assert!(is_excluded(".DS_Store"));
        assert!(is_excluded("src/__pycache__/mod.pyc"));
        assert!(is_excluded(".cache/pip/wheels/x.whl"));
    }

    #[test]
    fn regular_files_pass() {
        assert!(!is_excluded("notes.md"));
        assert!(!is_excluded("src/main.py"));
        assert!(!is_excluded("data/resultstmp.csv"), "suffix match must be on the extension");
        assert!(!is_excluded("cached_results.json"));
    }

    #[tokio::test]
    async fn retries_give_up_after_three_attempts() {
        let mut calls = 0u32;
        let result: Result<()> = with_retries("test op", || {
            calls += 1;
            async { anyhow::bail!("transient") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, SYNC_ATTEMPTS);
    }

    #[tokio::test]
    async fn retries_return_first_success() {
        let mut calls = 0u32;
        let result = with_retries("test op", || {
            calls += 1;
            let succeed = calls >= 2;
            async move {
                if succeed {
                    Ok(42)
                } else {
                    anyhow::bail!("transient")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls, 2);
    }
}
