//! Bearer-token authentication for the tracking server.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::io::files::write_atomic;

pub const TOKEN_ENV: &str = "MLFLOW_TRACKING_TOKEN";

/// Supplies bearer tokens for tracking requests.
pub trait Authenticator: Send + Sync {
    /// Make sure a usable token is available. Fails on unrecoverable auth errors.
    fn authenticate(&self) -> Result<()>;
    /// Persist the current credentials for the next job.
    fn save(&self) -> Result<()>;
    /// Token to send, if any.
    fn token(&self) -> Option<String>;
}

/// On-disk credentials (`{"token": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenFile {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracking_uri: Option<String>,
}

/// Token authentication backed by `MLFLOW_TRACKING_TOKEN` or a token file.
///
/// A disabled instance never sends a token and never touches the filesystem.
pub struct TokenAuth {
    tracking_uri: Option<String>,
    enabled: bool,
    token_file: Option<PathBuf>,
    token: RwLock<Option<String>>,
}

impl TokenAuth {
    pub fn new(tracking_uri: Option<&str>, enabled: bool, token_file: Option<&Path>) -> Self {
        Self {
            tracking_uri: tracking_uri.map(str::to_string),
            enabled,
            token_file: token_file.map(Path::to_path_buf),
            token: RwLock::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, false, None)
    }

    fn load_token(&self) -> Result<Option<String>> {
        if let Ok(token) = env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            debug!("using token from {TOKEN_ENV}");
            return Ok(Some(token.trim().to_string()));
        }
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read token file {}", path.display()))?;
        let file: TokenFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse token file {}", path.display()))?;
        debug!(path = %path.display(), "using token from file");
        Ok(Some(file.token))
    }
}

impl Authenticator for TokenAuth {
    /// Reloads the token on every call so a rotated env var or token file is
    /// picked up by a long run. A reload that finds nothing keeps the token
    /// already in use.
    fn authenticate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match self.load_token()? {
            Some(token) => {
                let mut current = self.token.write().unwrap_or_else(PoisonError::into_inner);
                match current.as_deref() {
                    None => info!(tracking_uri = ?self.tracking_uri, "tracking token loaded"),
                    Some(previous) if previous != token => {
                        info!(tracking_uri = ?self.tracking_uri, "tracking token refreshed")
                    }
                    Some(_) => {}
                }
                *current = Some(token);
                Ok(())
            }
            None if self.token().is_some() => {
                debug!("token source empty, keeping current token");
                Ok(())
            }
            None => match &self.token_file {
                Some(path) => bail!(
                    "no tracking token found: set {TOKEN_ENV} or write {}",
                    path.display()
                ),
                None => bail!("no tracking token found: set {TOKEN_ENV}"),
            },
        }
    }

    fn save(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let (Some(path), Some(token)) = (&self.token_file, self.token()) else {
            return Ok(());
        };
        let file = TokenFile {
            token,
            tracking_uri: self.tracking_uri.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&file).context("serialize token file")?;
        buf.push('\n');
        write_atomic(path, buf.as_bytes())
            .with_context(|| format!("save token file {}", path.display()))
    }

    fn token(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
