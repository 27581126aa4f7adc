//! Machine Custom Resource Definition
//!
//! The Machine is owned by the cluster API. The actuator only reads its spec and
//! mutates `spec.providerID`, labels, annotations and status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".metadata.labels['machine.openshift.io/instance-type']"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".metadata.labels['machine.openshift.io/region']"}"#,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".metadata.labels['machine.openshift.io/zone']"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Cloud provider identifier, `vsphere://<uuid>` once the VM exists
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Opaque provider configuration
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

/// Wrapper around the opaque provider payload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSpec {
    /// Raw provider configuration, decoded into a `VSphereMachineProviderSpec`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node linked to this Machine, set by the nodelink controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    /// Last time the status was written by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Opaque provider status, round-tripped as `VSphereMachineProviderStatus`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,

    /// Addresses assigned to the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Observed lifecycle phase (see [`phases`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Terminal error reason, set when the Machine moves to `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Terminal error message, set when the Machine moves to `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Reference to the Node backing a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    /// Node name
    pub name: String,
    /// Node UID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Kind of a machine address
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AddressType {
    /// Address reachable inside the cluster network
    #[serde(rename = "InternalIP")]
    InternalIp,
    /// DNS name resolvable inside the cluster network
    #[serde(rename = "InternalDNS")]
    InternalDns,
    /// Address reachable from outside the cluster
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    /// DNS name resolvable from outside the cluster
    #[serde(rename = "ExternalDNS")]
    ExternalDns,
    /// Hostname reported by the machine
    Hostname,
}

/// A single address of a Machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: AddressType,
    /// Address value
    pub address: String,
}

impl MachineAddress {
    /// Internal IP address entry
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self {
            type_: AddressType::InternalIp,
            address: address.into(),
        }
    }

    /// Internal DNS entry
    pub fn internal_dns(address: impl Into<String>) -> Self {
        Self {
            type_: AddressType::InternalDns,
            address: address.into(),
        }
    }
}

/// Phase strings written by the machine controller
pub mod phases {
    /// Machine accepted, VM not created yet
    pub const PROVISIONING: &str = "Provisioning";
    /// VM exists, node not linked yet
    pub const PROVISIONED: &str = "Provisioned";
    /// VM exists and a node is linked
    pub const RUNNING: &str = "Running";
    /// Deletion in progress
    pub const DELETING: &str = "Deleting";
    /// Terminal failure, requires user intervention
    pub const FAILED: &str = "Failed";
}

impl Machine {
    /// Current phase, if any
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    /// Name of the linked Node, if any
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .map(|n| n.name.as_str())
    }

    /// Value of a label, if present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Whether the given annotation key is present
    pub fn has_annotation(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(key))
    }
}
