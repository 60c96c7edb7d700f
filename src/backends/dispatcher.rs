//! Backend selection.
//!
//! Rules are checked in order on the first word of the request:
//! 1. alternate prefix: alternate hosted backend, only while hosted
//!    backends are available and the requester meets the minimum tier;
//! 2. sandbox prefix: sandboxed process backend, elevated tiers only;
//! 3. anything else: primary hosted backend, or the sandbox when hosted
//!    backends are unavailable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{Backend, REPLY_TITLE, Reply};
use crate::error::BackendError;
use crate::roles::AuthorityTier;
use crate::sessions::SessionStore;
use crate::worker::cancel::CancellationContext;
use crate::worker::job::Job;
use crate::worker::scheduler::Dispatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Primary,
    Alternate,
    Sandbox,
}

/// Where a request goes and the prompt the backend receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: RouteTarget,
    pub prompt: String,
}

/// Why a request may not be routed. The message is shown to the requester.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteDenied {
    #[error("The {prefix} feature is disabled while hosted backends are unavailable.")]
    AlternateDisabled { prefix: String },

    #[error("Only {required} users and above can use {prefix}.")]
    AlternateForbidden {
        prefix: String,
        required: AuthorityTier,
    },

    #[error("Only {required} users and above can use {prefix} commands.")]
    SandboxForbidden {
        prefix: String,
        required: AuthorityTier,
    },

    #[error("Please add a prompt after {prefix}.")]
    EmptyPrompt { prefix: String },
}

/// Routing rules, cheap to clone so the bot loop can pre-check requests.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub alternate_prefix: String,
    pub sandbox_prefix: String,
    pub alternate_min_tier: AuthorityTier,
    pub sandbox_min_tier: AuthorityTier,
    /// Whether the hosted backends may be used (quota still active).
    pub hosted_available: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            alternate_prefix: "alt".to_string(),
            sandbox_prefix: "local".to_string(),
            alternate_min_tier: AuthorityTier::Standard,
            sandbox_min_tier: AuthorityTier::Elevated,
            hosted_available: true,
        }
    }
}

/// Split off the first word if it equals `prefix`, ignoring case.
fn strip_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let (first, rest) = match text.find(char::is_whitespace) {
        Some(at) => text.split_at(at),
        None => (text, ""),
    };
    (!prefix.is_empty() && first.eq_ignore_ascii_case(prefix)).then(|| rest.trim())
}

impl RoutingPolicy {
    pub fn route(&self, text: &str, tier: AuthorityTier) -> Result<Route, RouteDenied> {
        if let Some(prompt) = strip_prefix(text, &self.alternate_prefix) {
            if !self.hosted_available {
                return Err(RouteDenied::AlternateDisabled {
                    prefix: self.alternate_prefix.clone(),
                });
            }
            if tier < self.alternate_min_tier {
                return Err(RouteDenied::AlternateForbidden {
                    prefix: self.alternate_prefix.clone(),
                    required: self.alternate_min_tier,
                });
            }
            return self.with_prompt(RouteTarget::Alternate, prompt, &self.alternate_prefix);
        }

        if let Some(prompt) = strip_prefix(text, &self.sandbox_prefix) {
            if tier < self.sandbox_min_tier {
                return Err(RouteDenied::SandboxForbidden {
                    prefix: self.sandbox_prefix.clone(),
                    required: self.sandbox_min_tier,
                });
            }
            return self.with_prompt(RouteTarget::Sandbox, prompt, &self.sandbox_prefix);
        }

        let target = if self.hosted_available {
            RouteTarget::Primary
        } else {
            RouteTarget::Sandbox
        };
        Ok(Route {
            target,
            prompt: text.trim().to_string(),
        })
    }

    fn with_prompt(
        &self,
        target: RouteTarget,
        prompt: &str,
        prefix: &str,
    ) -> Result<Route, RouteDenied> {
        if prompt.is_empty() {
            return Err(RouteDenied::EmptyPrompt {
                prefix: prefix.to_string(),
            });
        }
        Ok(Route {
            target,
            prompt: prompt.to_string(),
        })
    }
}

/// Routes jobs to backends; the scheduler's [`Dispatch`] implementation.
pub struct Dispatcher {
    policy: RoutingPolicy,
    primary: Option<Arc<dyn Backend>>,
    alternate: Option<Arc<dyn Backend>>,
    sandbox: Arc<dyn Backend>,
    sessions: Arc<SessionStore>,
}

impl Dispatcher {
    pub fn new(
        policy: RoutingPolicy,
        sandbox: Arc<dyn Backend>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            policy,
            primary: None,
            alternate: None,
            sandbox,
            sessions,
        }
    }

    pub fn with_primary(mut self, backend: Arc<dyn Backend>) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn with_alternate(mut self, backend: Arc<dyn Backend>) -> Self {
        self.alternate = Some(backend);
        self
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    fn backend_for(&self, target: RouteTarget) -> Result<&Arc<dyn Backend>, BackendError> {
        match target {
            // An unconfigured primary falls back like an exhausted quota.
            RouteTarget::Primary => Ok(self.primary.as_ref().unwrap_or(&self.sandbox)),
            RouteTarget::Alternate => {
                self.alternate
                    .as_ref()
                    .ok_or_else(|| BackendError::NotConfigured {
                        backend: "alternate".to_string(),
                    })
            }
            RouteTarget::Sandbox => Ok(&self.sandbox),
        }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(
        &self,
        job: &Job,
        ctx: &CancellationContext,
    ) -> Result<Option<Reply>, BackendError> {
        let route = match self.policy.route(&job.text, job.tier) {
            Ok(route) => route,
            Err(denied) => {
                tracing::warn!(job_id = %job.id, tier = %job.tier, "Route denied: {denied}");
                return Ok(Some(Reply::new(REPLY_TITLE, denied.to_string(), "")));
            }
        };

        let backend = self.backend_for(route.target)?;
        let workdir = if Arc::ptr_eq(backend, &self.sandbox) {
            Some(self.sessions.session_dir(&job.requester).await?)
        } else {
            None
        };

        tracing::info!(
            job_id = %job.id,
            backend = %backend.label(),
            target = ?route.target,
            "Invoking backend"
        );

        let text = backend
            .generate(&route.prompt, workdir.as_deref(), ctx)
            .await?;
        Ok(text.map(|text| Reply::new(REPLY_TITLE, text, backend.label())))
    }
}
