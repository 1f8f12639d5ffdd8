//! Error types for the instance model.

use thiserror::Error;

/// Errors that can occur when parsing paths or editing the instance tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The path string is empty.
    #[error("instance path cannot be empty")]
    EmptyPath,

    /// The path does not start with a slash.
    #[error("instance path must start with '/': got '{0}'")]
    MissingLeadingSlash(String),

    /// The path contains an empty segment (`//` or a trailing slash).
    #[error("instance path contains an empty segment: '{0}'")]
    EmptySegment(String),

    /// An instance name is not usable as a path segment.
    #[error("invalid instance name '{0}'")]
    InvalidName(String),

    /// A status label could not be parsed.
    #[error("unknown instance status '{0}'")]
    UnknownStatus(String),

    /// No instance exists at the given path.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// A sibling with the same name already exists.
    #[error("an instance named '{name}' already exists under {parent}")]
    DuplicateName { parent: String, name: String },
}

impl ModelError {
    /// Returns true if this error comes from parsing a path.
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            ModelError::EmptyPath
                | ModelError::MissingLeadingSlash(_)
                | ModelError::EmptySegment(_)
                | ModelError::InvalidName(_)
        )
    }
}
