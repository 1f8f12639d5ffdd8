//! Manager error types.
//!
//! Invalid transitions (redundant deploys, undeploying something that was
//! never provisioned, ...) are not errors: they are ignored. Everything else
//! surfaces as a [`ManagerError`] whose [`ErrorKind`] tells callers which
//! category occurred.

use std::fmt;

use dm_model::{InstancePath, ModelError};
use thiserror::Error;

use crate::messaging::MessagingError;
use crate::state::StoreError;
use crate::targets::TargetError;

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors returned by the deployment manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The application, a target or the messaging layer is not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("instance {path} not found in application {application}")]
    InstanceNotFound { application: String, path: String },

    /// The target handler failed to provide or release a machine.
    #[error("provisioning failed for {path}: {source}")]
    Provisioning {
        path: InstancePath,
        #[source]
        source: TargetError,
    },

    /// A message could not be handed to the messaging backend.
    #[error("failed to deliver message to {scope}: {source}")]
    Transport {
        scope: InstancePath,
        #[source]
        source: MessagingError,
    },

    /// The action is not allowed in the current state.
    #[error("unauthorized action: {0}")]
    Unauthorized(String),

    /// Configuration files for an instance could not be read.
    #[error("failed to read resources for {path}: {source}")]
    Resources {
        path: InstancePath,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Failures collected by a bulk operation.
    #[error(transparent)]
    Bulk(BulkError),
}

/// Error categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Provisioning,
    Transport,
    Unauthorized,
    Persistence,
    Bulk,
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::Configuration(_) | ManagerError::Resources { .. } => {
                ErrorKind::Configuration
            }
            ManagerError::ApplicationNotFound(_) | ManagerError::InstanceNotFound { .. } => {
                ErrorKind::NotFound
            }
            ManagerError::Model(e) if e.is_path_error() => ErrorKind::Configuration,
            ManagerError::Model(ModelError::InstanceNotFound(_)) => ErrorKind::NotFound,
            ManagerError::Model(_) => ErrorKind::Unauthorized,
            ManagerError::Provisioning { .. } => ErrorKind::Provisioning,
            ManagerError::Transport { .. } => ErrorKind::Transport,
            ManagerError::Unauthorized(_) => ErrorKind::Unauthorized,
            ManagerError::Persistence(_) => ErrorKind::Persistence,
            ManagerError::Bulk(_) => ErrorKind::Bulk,
        }
    }

    pub(crate) fn instance_not_found(application: &str, path: &InstancePath) -> Self {
        ManagerError::InstanceNotFound {
            application: application.to_string(),
            path: path.to_string(),
        }
    }
}

/// Per-instance failures of a pre-order traversal.
#[derive(Debug, Default)]
pub struct BulkError {
    pub failures: Vec<(InstancePath, ManagerError)>,
}

impl BulkError {
    pub fn push(&mut self, path: InstancePath, error: ManagerError) {
        self.failures.push((path, error));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> ManagerResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::Bulk(self))
        }
    }
}

impl fmt::Display for BulkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} instance(s) failed", self.failures.len())?;
        for (path, error) in &self.failures {
            write!(f, "; {path}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BulkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_error_lists_every_failure() {
        let mut bulk = BulkError::default();
        bulk.push(
            InstancePath::parse("/vm1").unwrap(),
            ManagerError::Configuration("no target".to_string()),
        );
        bulk.push(
            InstancePath::parse("/vm2").unwrap(),
            ManagerError::Unauthorized("busy".to_string()),
        );

        let err = bulk.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bulk);
        let text = err.to_string();
        assert!(text.starts_with("2 instance(s) failed"));
        assert!(text.contains("/vm1: configuration error: no target"));
        assert!(text.contains("/vm2"));
    }

    #[test]
    fn test_empty_bulk_is_ok() {
        assert!(BulkError::default().into_result().is_ok());
    }

    #[test]
    fn test_model_errors_are_categorized() {
        let not_found = ManagerError::from(ModelError::InstanceNotFound("/vm".to_string()));
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let bad_path = ManagerError::from(ModelError::EmptyPath);
        assert_eq!(bad_path.kind(), ErrorKind::Configuration);
    }
}
