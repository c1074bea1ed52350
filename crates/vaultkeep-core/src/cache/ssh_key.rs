use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::api::SshKeySource;
use crate::utils::{format_hours, write_private};

const SECONDS_PER_HOUR: u64 = 3600;

/// MFA-caching SSH private key kept on disk until it is too old.
pub struct SshKeyCache {
    key_path: PathBuf,
    max_age: Duration,
}

impl SshKeyCache {
    pub fn new(key_path: PathBuf, max_age_hours: u64) -> Self {
        Self {
            key_path,
            max_age: Duration::from_secs(max_age_hours.saturating_mul(SECONDS_PER_HOUR)),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Time since the key file was last written, `None` if there is no key.
    /// A modification time in the future counts as brand new.
    pub fn age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.key_path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    pub fn is_fresh(&self) -> bool {
        self.age().is_some_and(|age| age < self.max_age)
    }

    /// Make sure a usable key is on disk, downloading one if it is missing
    /// or stale. No network access while the cached key is fresh.
    pub async fn ensure_fresh(&self, source: &dyn SshKeySource) -> bool {
        match self.age() {
            Some(age) if age < self.max_age => {
                debug!(age = %format_hours(age), "SSH key still valid");
                return true;
            }
            Some(age) => info!(age = %format_hours(age), "SSH key stale, refreshing"),
            None => info!(path = %self.key_path.display(), "No SSH key found, downloading"),
        }
        self.refresh(source).await
    }

    /// Download and store a new key regardless of the cached one's age
    pub async fn refresh(&self, source: &dyn SshKeySource) -> bool {
        let key = match source.fetch_ssh_key().await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("Vault returned no OpenSSH key");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to download SSH key");
                return false;
            }
        };

        // OpenSSH refuses keys without a trailing newline
        let mut contents = key;
        if !contents.ends_with('\n') {
            contents.push('\n');
        }

        match write_private(&self.key_path, contents.as_bytes()) {
            Ok(()) => {
                info!(path = %self.key_path.display(), "SSH key saved");
                true
            }
            Err(e) => {
                warn!(path = %self.key_path.display(), error = %e, "Failed to save SSH key");
                false
            }
        }
    }
}
