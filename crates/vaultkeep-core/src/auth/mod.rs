//! Session authentication.
//!
//! The session token lives in a single file shared with the keepalive
//! watchdog. [`AuthSession`] is its only writer; the watchdog only reads it.

pub mod credentials;
pub mod error;
pub mod session;
pub mod token;

pub use credentials::{CredentialStore, KeyringPrompt, SecretSource, PASSWORD_ENV};
pub use error::AuthError;
pub use session::{AuthSession, SessionState};
pub use token::{Token, TokenState, TokenStateError, TokenStore, TOKEN_FILE};
