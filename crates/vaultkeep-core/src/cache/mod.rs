//! Local caching of time-boxed credentials.
//!
//! The vault's MFA-caching SSH key is valid for roughly as long as a
//! keepalive run, so it is kept on disk and only re-downloaded once it is
//! older than `key_max_age_hours`.

pub mod ssh_key;

pub use ssh_key::SshKeyCache;
