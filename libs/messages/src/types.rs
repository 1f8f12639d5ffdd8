//! Command and notification payloads.

use std::collections::BTreeMap;

use dm_model::{Import, Instance, InstancePath, InstanceStatus};
use serde::{Deserialize, Serialize};

/// File name → file content, shipped to agents to configure an instance.
pub type FileBundle = BTreeMap<String, Vec<u8>>;

// =============================================================================
// Commands (DM → agent)
// =============================================================================

/// Tells an agent which scoped instance it embodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetIdentity {
    pub application_name: String,
    /// The scoped instance with its whole subtree.
    pub scoped_instance: Instance,
    /// Resolved exports of every instance of the subtree, keyed by path.
    #[serde(default)]
    pub exported_variables: BTreeMap<InstancePath, BTreeMap<String, String>>,
}

/// Asks an agent to move one of its instances to a new state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeState {
    pub instance_path: InstancePath,
    pub new_state: InstanceStatus,
    /// `None` when the target state needs no configuration files.
    #[serde(default)]
    pub file_name_to_file_content: Option<FileBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddInstance {
    pub parent_path: InstancePath,
    pub instance: Instance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInstance {
    pub instance_path: InstancePath,
}

/// Tells an agent that an exporter it may import from is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveImport {
    pub application_name: String,
    /// Import prefix (component or facet name).
    pub component_or_facet_name: String,
    pub removed_instance_path: InstancePath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProbeConfiguration {
    pub instance_path: InstancePath,
    pub probe_resources: FileBundle,
}

/// A command sent by the DM to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SetIdentity(SetIdentity),
    ChangeState(ChangeState),
    AddInstance(AddInstance),
    RemoveInstance(RemoveInstance),
    RemoveImport(RemoveImport),
    Resynchronize,
    UpdateProbeConfiguration(UpdateProbeConfiguration),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::SetIdentity(_) => "set_identity",
            Command::ChangeState(_) => "change_state",
            Command::AddInstance(_) => "add_instance",
            Command::RemoveInstance(_) => "remove_instance",
            Command::RemoveImport(_) => "remove_import",
            Command::Resynchronize => "resynchronize",
            Command::UpdateProbeConfiguration(_) => "update_probe_configuration",
        }
    }

    pub fn is_set_identity(&self) -> bool {
        matches!(self, Command::SetIdentity(_))
    }
}

// =============================================================================
// Notifications (agent → DM)
// =============================================================================

/// Periodic liveness signal from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub application_name: String,
    pub scoped_instance_path: InstancePath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// The agent does not know its identity yet and asks for it.
    #[serde(default)]
    pub model_required: bool,
}

/// The agent learned that its machine is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDown {
    pub application_name: String,
    pub scoped_instance_path: InstancePath,
}

/// An agent reports the status of one of its instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChanged {
    pub application_name: String,
    pub instance_path: InstancePath,
    pub new_status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<BTreeMap<String, Vec<Import>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemoved {
    pub application_name: String,
    pub instance_path: InstancePath,
}

/// A notification sent by an agent to the DM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Heartbeat(Heartbeat),
    MachineDown(MachineDown),
    InstanceChanged(InstanceChanged),
    InstanceRemoved(InstanceRemoved),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Heartbeat(_) => "heartbeat",
            Notification::MachineDown(_) => "machine_down",
            Notification::InstanceChanged(_) => "instance_changed",
            Notification::InstanceRemoved(_) => "instance_removed",
        }
    }

    pub fn application_name(&self) -> &str {
        match self {
            Notification::Heartbeat(n) => &n.application_name,
            Notification::MachineDown(n) => &n.application_name,
            Notification::InstanceChanged(n) => &n.application_name,
            Notification::InstanceRemoved(n) => &n.application_name,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// Any message crossing the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "body", rename_all = "snake_case")]
pub enum Message {
    Command(Command),
    Notification(Notification),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Command(c) => c.kind(),
            Message::Notification(n) => n.kind(),
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Message::Command(c) => Some(c),
            Message::Notification(_) => None,
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}
