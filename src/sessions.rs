//! Per-requester working directories for the sandbox backend.
//!
//! Each requester gets a directory under the base dir: `<id>_default` on
//! first use, or a fresh `<name>_<millis>` after they ask for a new session.
//! The mapping lives in memory only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::SessionError;
use crate::worker::job::Requester;

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// Replace everything except ASCII letters, digits, `_` and `-` with `_`.
pub fn sanitize_name(name: &str) -> String {
    let safe = UNSAFE_CHARS.replace_all(name, "_").into_owned();
    if safe.is_empty() { "_".to_string() } else { safe }
}

pub struct SessionStore {
    base_dir: PathBuf,
    sessions: RwLock<HashMap<String, PathBuf>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn key(requester: &Requester) -> String {
        format!("{}:{}", requester.channel, requester.id)
    }

    /// Current session directory, created lazily as `<id>_default`.
    pub async fn session_dir(&self, requester: &Requester) -> Result<PathBuf, SessionError> {
        let key = Self::key(requester);
        if let Some(dir) = self.sessions.read().await.get(&key) {
            return Ok(dir.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(dir) = sessions.get(&key) {
            return Ok(dir.clone());
        }
        let dir = self
            .base_dir
            .join(format!("{}_default", sanitize_name(&requester.id)));
        create_dir(&dir).await?;
        sessions.insert(key, dir.clone());
        Ok(dir)
    }

    /// Start a fresh session directory for the requester and make it current.
    pub async fn new_session(&self, requester: &Requester) -> Result<PathBuf, SessionError> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let dir = self.base_dir.join(format!(
            "{}_{stamp}",
            sanitize_name(requester.display_name())
        ));
        create_dir(&dir).await?;

        self.sessions
            .write()
            .await
            .insert(Self::key(requester), dir.clone());
        info!(
            requester = %requester.display_name(),
            dir = %dir.display(),
            "New session started"
        );
        Ok(dir)
    }
}

async fn create_dir(dir: &Path) -> Result<(), SessionError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| SessionError::CreateDir {
            path: dir.display().to_string(),
            source,
        })
}
