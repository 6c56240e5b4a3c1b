use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced out of the build coordinator. Every failure
/// carries a kind plus a message; the HTTP layer maps kinds to status
/// codes. `Clone` because one terminal value fans out to every
/// subscriber of an in-flight build.
#[derive(Debug, Clone, Error)]
pub enum Failure {
    /// Malformed identity, disallowed module prefix, unsupported
    /// target, or invalid toolchain version.
    #[error("{0}")]
    User(String),

    /// The module proxy, release catalog, or a peer verifier returned
    /// a non-success status or an unparseable body. Transient; never
    /// cached.
    #[error("{0}")]
    Remote(String),

    /// The toolchain exited non-zero. The captured build log is
    /// preserved at `log_path` and served as an artifact.
    #[error("build failed")]
    Build { log_path: PathBuf },

    /// I/O, invariant violation, or other internal error.
    #[error("{0}")]
    Server(String),
}

impl Failure {
    pub fn user(msg: impl Into<String>) -> Self {
        Failure::User(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Failure::Remote(msg.into())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Failure::Server(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Failure::User(_) => "user",
            Failure::Remote(_) => "remote",
            Failure::Build { .. } => "build",
            Failure::Server(_) => "server",
        }
    }
}
