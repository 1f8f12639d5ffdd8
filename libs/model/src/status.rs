//! Instance lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Not deployed (initial and terminal state).
    #[default]
    NotDeployed,
    Deploying,
    DeployedStarted,
    Starting,
    DeployedStopped,
    Stopping,
    Undeploying,
    /// The agent stopped answering, or reported an error.
    Problem,
    /// Transient state after a manager restart, until the agent confirms.
    Restoring,
}

impl InstanceStatus {
    /// States an agent converges to and stays in.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Self::NotDeployed | Self::DeployedStarted | Self::DeployedStopped
        )
    }

    /// States the health monitor tracks heartbeats for.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            Self::DeployedStarted | Self::DeployedStopped | Self::Problem | Self::Restoring
        )
    }

    /// Target states that need a configuration bundle to be reached.
    pub fn requires_resources(&self) -> bool {
        matches!(self, Self::DeployedStarted | Self::DeployedStopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDeployed => "NOT_DEPLOYED",
            Self::Deploying => "DEPLOYING",
            Self::DeployedStarted => "DEPLOYED_STARTED",
            Self::Starting => "STARTING",
            Self::DeployedStopped => "DEPLOYED_STOPPED",
            Self::Stopping => "STOPPING",
            Self::Undeploying => "UNDEPLOYING",
            Self::Problem => "PROBLEM",
            Self::Restoring => "RESTORING",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "NOT_DEPLOYED" => Self::NotDeployed,
            "DEPLOYING" => Self::Deploying,
            "DEPLOYED_STARTED" => Self::DeployedStarted,
            "STARTING" => Self::Starting,
            "DEPLOYED_STOPPED" => Self::DeployedStopped,
            "STOPPING" => Self::Stopping,
            "UNDEPLOYING" => Self::Undeploying,
            "PROBLEM" => Self::Problem,
            "RESTORING" => Self::Restoring,
            _ => return Err(ModelError::UnknownStatus(s.to_string())),
        };
        Ok(status)
    }
}
