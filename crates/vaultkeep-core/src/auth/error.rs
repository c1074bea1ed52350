use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authentication rejected: {0}")]
    Rejected(#[source] ApiError),

    #[error("Unable to reach the vault: {0}")]
    Transport(#[source] ApiError),

    #[error("Unexpected response from the vault: {0}")]
    Api(#[source] ApiError),

    #[error("No username configured - set one in config.json or pass --username")]
    NoUsername,

    #[error("Could not obtain password: {0}")]
    Secret(String),

    #[error("Failed to save session token: {0}")]
    TokenStore(#[source] std::io::Error),

    #[error("Session failed earlier and cannot be refreshed")]
    SessionFailed,
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        if err.is_auth_rejection() {
            AuthError::Rejected(err)
        } else if err.is_transport() {
            AuthError::Transport(err)
        } else {
            AuthError::Api(err)
        }
    }
}
