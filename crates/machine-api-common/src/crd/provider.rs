//! vSphere provider spec and status payloads
//!
//! These are carried opaquely inside `Machine.spec.providerSpec.value` and
//! `Machine.status.providerStatus` and decoded by the actuator on every reconcile.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{InstanceState, ProviderCondition};

/// Desired configuration of a vSphere machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineProviderSpec {
    /// API version of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name or inventory path of the VM template to clone
    #[serde(default)]
    pub template: String,

    /// Placement targets on vCenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,

    /// NIC configuration
    #[serde(default)]
    pub network: NetworkSpec,

    /// Number of virtual CPUs
    #[serde(rename = "numCPUs", default)]
    pub num_cpus: i32,

    /// Cores per socket; defaults to `numCPUs`
    #[serde(default)]
    pub num_cores_per_socket: i32,

    /// Memory size in MiB
    #[serde(rename = "memoryMiB", default)]
    pub memory_mib: i64,

    /// Primary disk size in GiB; may only grow the template's disk
    #[serde(rename = "diskGiB", default)]
    pub disk_gib: i32,

    /// Additional disks attached at clone time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_disks: Vec<DataDisk>,

    /// Additional vCenter tag IDs to attach to the VM
    #[serde(rename = "tagIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,

    /// Snapshot name used for linked clones; the template's current snapshot when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot: String,

    /// Full or linked clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_mode: Option<CloneMode>,

    /// Secret holding the ignition payload under key `userData`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<LocalSecretReference>,

    /// Secret holding `<server>.username` and `<server>.password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<LocalSecretReference>,
}

impl VSphereMachineProviderSpec {
    /// Workspace, or an empty one when unset
    pub fn workspace(&self) -> Workspace {
        self.workspace.clone().unwrap_or_default()
    }

    /// Whether a linked clone was requested
    pub fn is_linked_clone(&self) -> bool {
        self.clone_mode == Some(CloneMode::LinkedClone)
    }

    /// Whether any NIC carries static IP configuration
    pub fn has_static_ips(&self) -> bool {
        self.network
            .devices
            .iter()
            .any(|d| !d.ip_addrs.is_empty() || !d.addresses_from_pools.is_empty())
    }

    /// Whether any NIC requests addresses from an IPAM pool
    pub fn uses_ip_pools(&self) -> bool {
        self.network
            .devices
            .iter()
            .any(|d| !d.addresses_from_pools.is_empty())
    }
}

/// vCenter placement targets; every field falls back to the finder default when unset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// vCenter server address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Datacenter name or path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    /// VM folder name or path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// Datastore name or path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    /// Resource pool path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    /// Cluster VM group the VM joins after cloning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_group: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl Workspace {
    /// Server, treating an empty string as unset
    pub fn server(&self) -> Option<&str> {
        non_empty(&self.server)
    }

    /// Datacenter, treating an empty string as unset
    pub fn datacenter(&self) -> Option<&str> {
        non_empty(&self.datacenter)
    }

    /// Folder, treating an empty string as unset
    pub fn folder(&self) -> Option<&str> {
        non_empty(&self.folder)
    }

    /// Datastore, treating an empty string as unset
    pub fn datastore(&self) -> Option<&str> {
        non_empty(&self.datastore)
    }

    /// Resource pool, treating an empty string as unset
    pub fn resource_pool(&self) -> Option<&str> {
        non_empty(&self.resource_pool)
    }

    /// VM group, treating an empty string as unset
    pub fn vm_group(&self) -> Option<&str> {
        non_empty(&self.vm_group)
    }
}

/// Clone strategy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CloneMode {
    /// Copy every disk of the template
    #[serde(rename = "fullClone")]
    FullClone,
    /// Share disk backing with a template snapshot
    #[serde(rename = "linkedClone")]
    LinkedClone,
}

/// An additional disk attached at clone time
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    /// Disk name, unique per machine
    pub name: String,
    /// Size in GiB
    #[serde(rename = "sizeGiB")]
    pub size_gib: i32,
    /// Backing provisioning mode; vCenter default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_mode: Option<ProvisioningMode>,
}

/// Disk provisioning mode
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningMode {
    /// Allocate on demand
    Thin,
    /// Allocate up front, zero lazily
    Thick,
    /// Allocate up front and zero immediately
    EagerlyZeroed,
}

/// NIC configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// One entry per NIC, in device order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<NetworkDeviceSpec>,
}

/// Configuration of a single NIC
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    /// Name of the vCenter network the NIC attaches to
    #[serde(default)]
    pub network_name: String,
    /// Default gateway for static addresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Static addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,
    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// IPAM pools to claim addresses from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses_from_pools: Vec<AddressesFromPool>,
}

/// Reference to an IPAM pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressesFromPool {
    /// API group of the pool resource
    pub group: String,
    /// Kind of the pool resource
    pub resource: String,
    /// Pool name
    pub name: String,
}

/// Reference to a Secret in the Machine's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalSecretReference {
    /// Secret name
    pub name: String,
}

/// Observed state of a vSphere machine, persisted in `status.providerStatus`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineProviderStatus {
    /// API version of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind of the embedded object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// vCenter UUID of the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Last observed power state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,

    /// Provider conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ProviderCondition>,

    /// Most recently launched vCenter task; empty means nothing in flight
    #[serde(default)]
    pub task_ref: String,
}
