//! Layered server configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional YAML file, `GHB__*` environment variables, and finally command
//! line flags applied by the binary.

use crate::auth::{AuthPolicy, Credentials};
use crate::error::ConfigError;
use crate::observability::LogFormat;
use crate::server::ServerOptions;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GHB";

/// Full server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub listen_addr: SocketAddr,
    /// Repository owner, the first path segment.
    pub owner: String,
    /// Repository name, served as `{owner}/{repo}.git`.
    pub repo: String,
    /// Upper bound on a single upload-pack or receive-pack call.
    pub session_timeout_secs: u64,
    /// Basic credentials; absent means authentication is disabled.
    pub auth: Option<Credentials>,
    /// Level for the `ghb` crates, e.g. `info` or `debug`.
    pub log_level: String,
    /// Pretty or JSON log lines.
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            owner: "ghb".to_string(),
            repo: "sandbox".to_string(),
            session_timeout_secs: ServerOptions::DEFAULT_SESSION_TIMEOUT.as_secs(),
            auth: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from an optional file and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(
            path,
            config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        )
    }

    pub(crate) fn load_from(
        path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(environment.try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Session timeout as a duration.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Options for [`Server::new`](crate::Server::new).
    pub fn options(&self) -> ServerOptions {
        let options = ServerOptions::default().with_session_timeout(self.session_timeout());
        match &self.auth {
            Some(creds) => options.with_auth(AuthPolicy::Basic(creds.clone())),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> config::Environment {
        env_with(&[])
    }

    fn env_with(vars: &[(&str, &str)]) -> config::Environment {
        let source: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(source))
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load_from(None, no_env()).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.session_timeout(), Duration::from_secs(300));
        assert!(config.auth.is_none());
        assert_eq!(config.options().auth, AuthPolicy::Disabled);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_yaml_file() {
        let file = yaml_file(
            "owner: alice\nrepo: tools\nsession_timeout_secs: 30\nlog_format: json\nauth:\n  username: alice\n  password: secret\n",
        );
        let config = ServerConfig::load_from(Some(file.path()), no_env()).unwrap();
        assert_eq!(config.owner, "alice");
        assert_eq!(config.repo, "tools");
        assert_eq!(config.log_format, LogFormat::Json);

        let options = config.options();
        assert_eq!(options.session_timeout, Duration::from_secs(30));
        assert!(options.auth.is_enabled());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = yaml_file("owner: alice\nrepo: tools\n");
        let env = env_with(&[
            ("GHB__REPO", "other"),
            ("GHB__SESSION_TIMEOUT_SECS", "5"),
            ("GHB__AUTH__USERNAME", "bob"),
            ("GHB__AUTH__PASSWORD", "pw"),
        ]);
        let config = ServerConfig::load_from(Some(file.path()), env).unwrap();
        assert_eq!(config.owner, "alice");
        assert_eq!(config.repo, "other");
        assert_eq!(config.session_timeout_secs, 5);
        assert_eq!(config.auth, Some(Credentials::new("bob", "pw")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ServerConfig::load_from(Some(Path::new("/nonexistent/ghb.yaml")), no_env());
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
