//! Shared-secret authentication for the HTTP surface.
//!
//! The secret authenticates the calling service (dashboard, proxy), not the
//! end user; user identity rides in its own header and is validated
//! separately. An absent secret is an explicit local-development opt-in and
//! is warned about loudly at startup.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing API key header")]
    MissingKey,
    #[error("invalid API key")]
    WrongKey,
}

pub struct SharedSecretAuth {
    secret: Option<String>,
    header_name: String,
}

impl SharedSecretAuth {
    pub fn new(secret: Option<String>, header_name: String) -> Self {
        let secret = secret.filter(|value| !value.is_empty());
        if secret.is_none() {
            warn!("no API key configured; requests are accepted unauthenticated");
        }
        Self {
            secret,
            header_name,
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };

        let presented = headers
            .get(&self.header_name)
            .ok_or(AuthError::MissingKey)?
            .to_str()
            .map_err(|_| AuthError::WrongKey)?;

        if digest_eq(presented, secret) {
            Ok(())
        } else {
            Err(AuthError::WrongKey)
        }
    }
}

/// Constant-time comparison by hashing both sides first: the digests are
/// fixed-length and unpredictable, so the byte-wise comparison leaks nothing
/// about the secret.
fn digest_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}
