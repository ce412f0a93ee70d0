//! Authentication state machine
//!
//! Supplying credentials or a token resets the state to `InProgress` and
//! yields exactly one [`AuthRequest`] for the background job to run. Every
//! reset bumps a generation counter so that a result arriving for an older
//! request is discarded.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::remote::{AuthFailure, Credentials, Session};

/// Outcome of the background credential/token exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationStatus {
    NoCredentials,
    InProgress,
    Succeeded,
    FailedToConnect,
    InvalidCredentials,
    SessionExpired,
    SessionTimedOut,
}

/// What the background job authenticates with
#[derive(Debug, Clone)]
pub(crate) enum AuthSource {
    Credentials {
        api_url: String,
        credentials: Credentials,
    },
    Token {
        api_url: Option<String>,
        token: String,
    },
}

impl AuthSource {
    fn api_url(&self) -> Option<&str> {
        match self {
            Self::Credentials { api_url, .. } => Some(api_url),
            Self::Token { api_url, .. } => api_url.as_deref(),
        }
    }
}

/// A scheduled authentication attempt
#[derive(Debug, Clone)]
pub(crate) struct AuthRequest {
    pub generation: u64,
    pub source: AuthSource,
}

#[derive(Debug)]
pub(crate) struct AuthState {
    status: AuthenticationStatus,
    message: Option<String>,
    session: Option<Session>,
    source: Option<AuthSource>,
    generation: u64,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            status: AuthenticationStatus::NoCredentials,
            message: None,
            session: None,
            source: None,
            generation: 0,
        }
    }
}

impl AuthState {
    pub fn status(&self) -> AuthenticationStatus {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// API URL of the most recent request, if any
    pub fn api_url(&self) -> Option<&str> {
        self.source.as_ref().and_then(AuthSource::api_url)
    }

    /// Reset to `InProgress` and produce the request to run
    pub fn begin(&mut self, source: AuthSource) -> AuthRequest {
        self.generation += 1;
        self.status = AuthenticationStatus::InProgress;
        self.message = None;
        self.session = None;
        self.source = Some(source.clone());
        debug!(generation = self.generation, "authentication requested");
        AuthRequest {
            generation: self.generation,
            source,
        }
    }

    /// Apply a finished request. Returns false when the result is stale.
    pub fn complete(&mut self, generation: u64, outcome: Result<Session, AuthFailure>) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "discarding stale authentication result"
            );
            return false;
        }

        match outcome {
            Ok(session) => {
                info!(api_url = %session.api_url, "authenticated");
                self.status = AuthenticationStatus::Succeeded;
                self.message = None;
                self.session = Some(session);
            }
            Err(failure) => {
                warn!(error = %failure, "authentication failed");
                self.status = match &failure {
                    AuthFailure::InvalidCredentials(_) => AuthenticationStatus::InvalidCredentials,
                    AuthFailure::FailedToConnect(_) => AuthenticationStatus::FailedToConnect,
                    AuthFailure::SessionExpired(_) => AuthenticationStatus::SessionExpired,
                    AuthFailure::SessionTimedOut(_) => AuthenticationStatus::SessionTimedOut,
                };
                self.message = Some(failure.to_string());
                self.session = None;
            }
        }
        true
    }

    /// A web job reported the session as expired.
    ///
    /// Credentials can be replayed, so a re-authentication request is
    /// returned for them; a token cannot be refreshed and the state stays
    /// `SessionExpired`.
    pub fn expire(&mut self, message: &str) -> Option<AuthRequest> {
        if self.status != AuthenticationStatus::Succeeded {
            return None;
        }

        self.status = AuthenticationStatus::SessionExpired;
        self.message = Some(message.to_string());
        self.session = None;

        match self.source.clone() {
            Some(source @ AuthSource::Credentials { .. }) => Some(self.begin(source)),
            _ => None,
        }
    }

    /// Forget everything; any in-flight result will be discarded
    pub fn clear(&mut self) {
        self.generation += 1;
        self.status = AuthenticationStatus::NoCredentials;
        self.message = None;
        self.session = None;
        self.source = None;
    }
}
