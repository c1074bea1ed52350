use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

/// Keyring service name
const SERVICE_NAME: &str = "vaultkeep";

/// Environment variable that supplies the password non-interactively
pub const PASSWORD_ENV: &str = "VAULTKEEP_PASSWORD";

pub struct CredentialStore;

impl CredentialStore {
    /// Store username and password in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve password for a username from the OS keychain
    pub fn get_password(username: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Delete stored credentials for a username
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}

/// Where `AuthSession` gets the logon password from.
pub trait SecretSource: Send + Sync {
    fn password(&self, username: &str) -> Result<String>;

    /// Persist a password that just worked
    fn remember(&self, username: &str, password: &str) -> Result<()>;
}

/// Environment override, then the OS keychain, then an interactive prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringPrompt;

impl SecretSource for KeyringPrompt {
    fn password(&self, username: &str) -> Result<String> {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                debug!("Using password from environment");
                return Ok(password);
            }
        }

        match CredentialStore::get_password(username) {
            Ok(password) if !password.is_empty() => {
                debug!(username, "Using password from keychain");
                return Ok(password);
            }
            Ok(_) => {}
            Err(e) => debug!(username, error = %e, "No keychain password"),
        }

        rpassword::prompt_password(format!("Password for {}: ", username))
            .context("Failed to read password")
    }

    fn remember(&self, username: &str, password: &str) -> Result<()> {
        CredentialStore::store(username, password)
    }
}
