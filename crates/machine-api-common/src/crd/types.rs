//! Supporting types shared by the provider status

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Power state of a VM as recorded in the provider status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    /// VM is running
    PoweredOn,
    /// VM is stopped
    PoweredOff,
    /// VM is suspended
    Suspended,
}

impl InstanceState {
    /// vCenter string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoweredOn => "poweredOn",
            Self::PoweredOff => "poweredOff",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is met
    True,
    /// Condition is not met
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Condition recorded in the provider status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCondition {
    /// Condition type (see [`condition_types`])
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Last time the condition was probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ProviderCondition {
    /// Create a condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status,
            last_probe_time: Some(now),
            last_transition_time: Some(now),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Condition type names
pub mod condition_types {
    /// Outcome of the create flow
    pub const MACHINE_CREATION: &str = "MachineCreation";
    /// Whether all IP address claims for the machine are bound
    pub const IP_ADDRESS_CLAIMED: &str = "IPAddressClaimed";
}

/// Condition reason strings
pub mod reasons {
    /// Create flow completed without error
    pub const MACHINE_CREATION_SUCCEEDED: &str = "MachineCreationSucceeded";
    /// Create flow returned an error
    pub const MACHINE_CREATION_FAILED: &str = "MachineCreationFailed";
    /// At least one IP address claim is still unbound
    pub const WAITING_FOR_IP_ADDRESS: &str = "WaitingForIPAddress";
    /// Every IP address claim is bound
    pub const IP_ADDRESSES_CLAIMED: &str = "IPAddressesClaimed";
}
