//! Remote calculation service seam
//!
//! The engine never speaks a wire protocol itself. Authentication and realm
//! resolution are delegated to a [`RemoteService`] supplied at construction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::{ContextRequestParameters, FrameworkContext, FrameworkUsageInfo};

/// User credentials for the remote service
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated session with the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Service the session belongs to
    pub api_url: String,
    /// Bearer token attached to web requests
    pub token: String,
    /// Authenticated user, when known
    pub user: Option<String>,
}

/// Why an authentication attempt did not produce a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("failed to connect: {0}")]
    FailedToConnect(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("session timed out: {0}")]
    SessionTimedOut(String),
}

/// Why a realm could not be resolved into a context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextFailure {
    #[error("realm not found: {0}")]
    NotFound(String),

    #[error("failed to connect: {0}")]
    FailedToConnect(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Blocking client for the remote service. Calls run on web worker threads.
pub trait RemoteService: Send + Sync {
    /// Exchange credentials for a session
    fn authenticate(&self, api_url: &str, credentials: &Credentials)
        -> Result<Session, AuthFailure>;

    /// Validate a pre-issued token and turn it into a session
    fn authenticate_token(&self, api_url: Option<&str>, token: &str)
        -> Result<Session, AuthFailure>;

    /// Resolve a realm into an execution context
    fn resolve_context(
        &self,
        session: Option<&Session>,
        framework: &FrameworkUsageInfo,
        params: &ContextRequestParameters,
    ) -> Result<FrameworkContext, ContextFailure>;
}

/// Service used when no remote is configured; every call fails to connect
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineRemoteService;

impl RemoteService for OfflineRemoteService {
    fn authenticate(&self, api_url: &str, _: &Credentials) -> Result<Session, AuthFailure> {
        Err(AuthFailure::FailedToConnect(format!(
            "no remote service available for {}",
            api_url
        )))
    }

    fn authenticate_token(&self, _: Option<&str>, _: &str) -> Result<Session, AuthFailure> {
        Err(AuthFailure::FailedToConnect(
            "no remote service available".to_string(),
        ))
    }

    fn resolve_context(
        &self,
        _: Option<&Session>,
        _: &FrameworkUsageInfo,
        params: &ContextRequestParameters,
    ) -> Result<FrameworkContext, ContextFailure> {
        Err(ContextFailure::FailedToConnect(format!(
            "no remote service available for {}",
            params.api_url
        )))
    }
}
