//! Role table. Maps requester identities to authority tiers.
//!
//! The table is a small JSON file with one top-tier identity and a list of
//! elevated identities; everyone else is standard. It can be reloaded at
//! runtime without restarting the relay.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RoleError;

/// Authority tier of a requester. Higher tiers are scheduled first and may
/// preempt or cancel lower-tier jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityTier {
    Standard = 1,
    Elevated = 2,
    Privileged = 3,
}

impl AuthorityTier {
    /// The tier allowed to stop any job.
    pub const TOP: AuthorityTier = AuthorityTier::Privileged;

    /// Numeric priority level.
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn is_top(self) -> bool {
        self == Self::TOP
    }
}

impl std::fmt::Display for AuthorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Elevated => "elevated",
            Self::Privileged => "privileged",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AuthorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "everyone" | "1" => Ok(Self::Standard),
            "elevated" | "admin" | "2" => Ok(Self::Elevated),
            "privileged" | "creator" | "3" => Ok(Self::Privileged),
            other => Err(format!("unknown authority tier '{other}'")),
        }
    }
}

/// On-disk role table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTable {
    /// The single top-tier identity.
    pub privileged: Option<String>,
    /// Identities granted the elevated tier.
    pub elevated: Vec<String>,
}

impl RoleTable {
    /// Resolve a single identity. Empty identities are always standard.
    pub fn resolve(&self, identity: &str) -> AuthorityTier {
        if identity.is_empty() {
            return AuthorityTier::Standard;
        }
        if self.privileged.as_deref() == Some(identity) {
            return AuthorityTier::Privileged;
        }
        if self.elevated.iter().any(|e| e == identity) {
            return AuthorityTier::Elevated;
        }
        AuthorityTier::Standard
    }

    /// Resolve the highest tier granted to any of the given identities
    /// (e.g. a numeric user id and a username).
    pub fn resolve_any<'a, I>(&self, identities: I) -> AuthorityTier
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities
            .into_iter()
            .map(|id| self.resolve(id))
            .max()
            .unwrap_or(AuthorityTier::Standard)
    }
}

/// Reloadable role resolver.
#[derive(Debug)]
pub struct RoleResolver {
    path: Option<PathBuf>,
    table: RwLock<RoleTable>,
}

impl RoleResolver {
    /// Create an in-memory resolver (no backing file, `reload` is a no-op).
    pub fn new(table: RoleTable) -> Self {
        Self {
            path: None,
            table: RwLock::new(table),
        }
    }

    /// Load the role table from `path`, writing a default table there if the
    /// file does not exist yet.
    pub async fn load(path: impl Into<PathBuf>, defaults: RoleTable) -> Result<Self, RoleError> {
        let path = path.into();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| RoleError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let table = if exists {
            read_table(&path).await?
        } else {
            write_table(&path, &defaults).await?;
            info!(path = %path.display(), "Wrote default role table");
            defaults
        };

        Ok(Self {
            path: Some(path),
            table: RwLock::new(table),
        })
    }

    /// Re-read the backing file. The previous table stays active on error.
    pub async fn reload(&self) -> Result<(), RoleError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        match read_table(path).await {
            Ok(table) => {
                info!(
                    path = %path.display(),
                    elevated = table.elevated.len(),
                    "Role table reloaded"
                );
                self.replace(table);
                Ok(())
            }
            Err(e) => {
                warn!("Role table reload failed, keeping previous table: {e}");
                Err(e)
            }
        }
    }

    /// Swap in a new table.
    pub fn replace(&self, table: RoleTable) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    /// Resolve one identity against the current table.
    pub fn resolve(&self, identity: &str) -> AuthorityTier {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(identity)
    }

    /// Resolve the highest tier across several identities of one requester.
    pub fn resolve_any<'a, I>(&self, identities: I) -> AuthorityTier
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve_any(identities)
    }

    /// Copy of the current table.
    pub fn table(&self) -> RoleTable {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

async fn read_table(path: &Path) -> Result<RoleTable, RoleError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RoleError::Read {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| RoleError::Parse {
        path: path.display().to_string(),
        source,
    })
}

async fn write_table(path: &Path, table: &RoleTable) -> Result<(), RoleError> {
    let write_err = |source| RoleError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    // Serializing a plain struct of strings cannot fail.
    let json = serde_json::to_string_pretty(table).unwrap_or_else(|_| "{}".to_string());
    tokio::fs::write(path, json).await.map_err(write_err)
}
