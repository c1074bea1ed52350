use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::write_private;

/// Token file name in the install root
pub const TOKEN_FILE: &str = "token";

/// Opaque vault session token.
///
/// Always non-empty and free of surrounding whitespace. `Debug` never prints
/// the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Returns `None` for empty or whitespace-only input.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == value.len() {
            Some(Self(value))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<redacted, {} chars>)", self.0.len())
    }
}

/// What a read of the token file found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Missing,
    Empty,
    Present(Token),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenStateError {
    #[error("Token file missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("Token file is empty: {}", .0.display())]
    Empty(PathBuf),
}

/// File-backed holder of the current session token.
///
/// The only channel between the interactive process (the single writer)
/// and the keepalive watchdog (a reader). Writes are atomic replaces, so no
/// locking is needed between the two.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the well-known token path under `root`
    pub fn in_dir(root: &Path) -> Self {
        Self::new(root.join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the token file. Never fails: unreadable counts as missing.
    pub fn read(&self) -> TokenState {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match Token::new(contents) {
                Some(token) => TokenState::Present(token),
                None => TokenState::Empty,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => TokenState::Missing,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read token file");
                TokenState::Missing
            }
        }
    }

    /// The current token, or `None` when there is no usable session
    pub fn load(&self) -> Option<Token> {
        match self.read() {
            TokenState::Present(token) => Some(token),
            TokenState::Missing | TokenState::Empty => None,
        }
    }

    /// Like [`load`](Self::load) but says why there is no token
    pub fn require(&self) -> Result<Token, TokenStateError> {
        match self.read() {
            TokenState::Present(token) => Ok(token),
            TokenState::Missing => Err(TokenStateError::Missing(self.path.clone())),
            TokenState::Empty => Err(TokenStateError::Empty(self.path.clone())),
        }
    }

    /// Replace the stored token
    pub fn save(&self, token: &Token) -> io::Result<()> {
        write_private(&self.path, token.as_str().as_bytes())?;
        debug!(path = %self.path.display(), "Token saved");
        Ok(())
    }

    /// Delete the stored token. A missing file is not an error.
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Token cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TokenStore::in_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn test_token_new_trims_and_rejects_blank() {
        assert_eq!(Token::new(" abc \n").expect("token").as_str(), "abc");
        assert!(Token::new("").is_none());
        assert!(Token::new(" \t\n").is_none());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::new("super-secret").expect("token");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_fresh_store_is_absent() {
        let (_dir, store) = temp_store();
        assert_eq!(store.load(), None);
        assert_eq!(store.read(), TokenState::Missing);
    }

    #[test]
    fn test_load_after_save_returns_same_token() {
        let (_dir, store) = temp_store();
        for value in ["a", "YWJjZGVmZ2hpams=", "token with spaces inside"] {
            let token = Token::new(value).expect("token");
            store.save(&token).expect("save");
            assert_eq!(store.load(), Some(token));
        }
    }

    #[test]
    fn test_whitespace_file_is_empty_not_error() {
        let (_dir, store) = temp_store();
        std::fs::write(store.path(), "  \n").expect("write");
        assert_eq!(store.read(), TokenState::Empty);
        assert_eq!(store.load(), None);
        assert!(matches!(store.require(), Err(TokenStateError::Empty(_))));
    }

    #[test]
    fn test_trailing_newline_is_ignored() {
        let (_dir, store) = temp_store();
        std::fs::write(store.path(), "abc\n").expect("write");
        assert_eq!(store.load().expect("token").as_str(), "abc");
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_dir, store) = temp_store();
        store.save(&Token::new("abc").expect("token")).expect("save");
        store.clear().expect("clear");
        store.clear().expect("clear again");
        assert!(matches!(store.require(), Err(TokenStateError::Missing(_))));
    }

    #[test]
    fn test_save_overwrites_previous_token() {
        let (_dir, store) = temp_store();
        store.save(&Token::new("old").expect("token")).expect("save");
        store.save(&Token::new("new").expect("token")).expect("save");
        assert_eq!(std::fs::read_to_string(store.path()).expect("read"), "new");
    }
}
