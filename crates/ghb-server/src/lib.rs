//! # ghb server
//!
//! Git smart HTTP server for a single repository.
//!
//! A [`Server`] binds one [`GitStore`](ghb_storage::GitStore) to the three
//! smart HTTP endpoints under `/{owner}/{repo}.git`:
//!
//! - `GET info/refs?service=...` advertises references,
//! - `POST git-upload-pack` serves fetches and clones,
//! - `POST git-receive-pack` applies pushes.
//!
//! The protocol work is done by [`ghb_git`]; this crate handles HTTP
//! validation, authentication, per-request timeouts, configuration and
//! logging.
//!
//! ```rust,no_run
//! use ghb_server::{Server, ServerOptions};
//! use ghb_storage::Repository;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = Server::new(
//!     Arc::new(Repository::new()),
//!     "alice",
//!     "tools",
//!     ServerOptions::default().with_basic_auth("alice", "secret"),
//! )?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, server.router()).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod auth;
pub mod config;
mod error;
pub mod observability;
mod server;
pub mod testing;

pub use auth::{AuthPolicy, Credentials};
pub use config::ServerConfig;
pub use error::{ApiError, ConfigError, INTERNAL_ERROR_MESSAGE};
pub use server::{Server, ServerOptions};
