//! Realm/context resolution state machine

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::remote::ContextFailure;

/// Progress of resolving a realm into a framework context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRequestStatus {
    NoRequest,
    InProgress,
    Succeeded,
    FailedToConnect,
    NotFound,
    InvalidResponse,
}

/// Describes the application using the engine, sent along with realm requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkUsageInfo {
    pub app_name: String,
    pub app_version: String,
}

impl FrameworkUsageInfo {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Which realm to resolve, and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequestParameters {
    pub api_url: String,
    pub realm_id: String,
}

impl ContextRequestParameters {
    pub fn new(api_url: impl Into<String>, realm_id: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            realm_id: realm_id.into(),
        }
    }
}

/// Resolved execution scope that remote jobs run against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkContext {
    pub api_url: String,
    pub realm_id: String,
    pub context_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ContextRequest {
    pub generation: u64,
    pub framework: FrameworkUsageInfo,
    pub params: ContextRequestParameters,
}

#[derive(Debug)]
pub(crate) struct ContextState {
    status: ContextRequestStatus,
    message: Option<String>,
    context: Option<FrameworkContext>,
    generation: u64,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            status: ContextRequestStatus::NoRequest,
            message: None,
            context: None,
            generation: 0,
        }
    }
}

impl ContextState {
    pub fn status(&self) -> ContextRequestStatus {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn context(&self) -> Option<&FrameworkContext> {
        self.context.as_ref()
    }

    pub fn begin(
        &mut self,
        framework: FrameworkUsageInfo,
        params: ContextRequestParameters,
    ) -> ContextRequest {
        self.generation += 1;
        self.status = ContextRequestStatus::InProgress;
        self.message = None;
        self.context = None;
        debug!(realm = %params.realm_id, generation = self.generation, "context requested");
        ContextRequest {
            generation: self.generation,
            framework,
            params,
        }
    }

    /// Apply a finished request. Returns false when the result is stale.
    pub fn complete(
        &mut self,
        generation: u64,
        outcome: Result<FrameworkContext, ContextFailure>,
    ) -> bool {
        if generation != self.generation {
            debug!(generation, "discarding stale context result");
            return false;
        }

        match outcome {
            Ok(context) => {
                info!(realm = %context.realm_id, context = %context.context_id, "context resolved");
                self.status = ContextRequestStatus::Succeeded;
                self.message = None;
                self.context = Some(context);
            }
            Err(failure) => {
                warn!(error = %failure, "context resolution failed");
                self.status = match &failure {
                    ContextFailure::NotFound(_) => ContextRequestStatus::NotFound,
                    ContextFailure::FailedToConnect(_) => ContextRequestStatus::FailedToConnect,
                    ContextFailure::InvalidResponse(_) => ContextRequestStatus::InvalidResponse,
                };
                self.message = Some(failure.to_string());
                self.context = None;
            }
        }
        true
    }

    /// Install a pre-resolved context, superseding any request in flight
    pub fn set(&mut self, context: FrameworkContext) {
        self.generation += 1;
        self.status = ContextRequestStatus::Succeeded;
        self.message = None;
        self.context = Some(context);
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.status = ContextRequestStatus::NoRequest;
        self.message = None;
        self.context = None;
    }
}
