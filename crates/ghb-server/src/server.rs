//! The session façade: one object store bound to the smart HTTP endpoints.

use crate::auth::{AuthPolicy, Credentials};
use crate::error::ConfigError;
use axum::Router;
use ghb_storage::{GitStore, HEAD};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Construction options for [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Who may call the endpoints. Defaults to no authentication.
    pub auth: AuthPolicy,
    /// Limit on each upload-pack or receive-pack call; expiry answers 500.
    pub session_timeout: Duration,
}

impl ServerOptions {
    /// Timeout applied to each upload-pack and receive-pack call.
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

    /// Requires HTTP Basic authentication with exactly these credentials.
    pub fn with_basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.with_auth(AuthPolicy::Basic(Credentials::new(username, password)))
    }

    /// Replaces the authentication policy.
    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    /// Replaces the per-call session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            auth: AuthPolicy::Disabled,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// A smart HTTP server for a single repository.
///
/// Cloning is cheap; every clone shares the same store. Each request builds
/// its own protocol objects, so no negotiation state lives here.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn GitStore>,
    owner: String,
    repo: String,
    options: ServerOptions,
}

impl Server {
    /// Binds `store` to `{owner}/{repo}.git`.
    ///
    /// Owner and repository names are lower-cased. The store must already
    /// hold a `HEAD` reference, though it need not resolve yet.
    pub fn new(
        store: Arc<dyn GitStore>,
        owner: &str,
        repo: &str,
        options: ServerOptions,
    ) -> Result<Self, ConfigError> {
        let owner = owner.trim();
        let repo = repo.trim();
        if owner.is_empty() {
            return Err(ConfigError::OwnerMissing);
        }
        if repo.is_empty() {
            return Err(ConfigError::RepoNameMissing);
        }
        if store.find_ref(HEAD)?.is_none() {
            return Err(ConfigError::HeadMissing);
        }

        let server = Self {
            inner: Arc::new(Inner {
                store,
                owner: owner.to_lowercase(),
                repo: repo.to_lowercase(),
                options,
            }),
        };
        tracing::info!(
            repo_path = %server.repo_path(),
            auth = server.options().auth.is_enabled(),
            session_timeout_secs = server.options().session_timeout.as_secs(),
            "Smart HTTP server configured"
        );
        Ok(server)
    }

    /// Lower-cased owner name.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// Lower-cased repository name.
    pub fn repo(&self) -> &str {
        &self.inner.repo
    }

    /// Options the server was built with.
    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    pub(crate) fn store(&self) -> Arc<dyn GitStore> {
        Arc::clone(&self.inner.store)
    }

    /// `{owner}/{repo}.git`
    pub fn repo_path(&self) -> String {
        format!("{}/{}.git", self.inner.owner, self.inner.repo)
    }

    /// Route of the reference discovery endpoint.
    pub fn path_info_refs(&self) -> String {
        format!("/{}/info/refs", self.repo_path())
    }

    /// Route of the fetch endpoint.
    pub fn path_upload_pack(&self) -> String {
        format!("/{}/git-upload-pack", self.repo_path())
    }

    /// Route of the push endpoint.
    pub fn path_receive_pack(&self) -> String {
        format!("/{}/git-receive-pack", self.repo_path())
    }

    /// A ready-to-serve router with tracing and request IDs.
    pub fn router(&self) -> Router {
        crate::api::create_router(self.clone())
    }

    /// Adds the three smart HTTP routes to an existing router.
    pub fn setup_routes<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.merge(crate::api::routes(self.clone()))
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("repo_path", &self.repo_path())
            .field("options", &self.inner.options)
            .finish()
    }
}
