//! Typed subset of the vSphere inventory model
//!
//! Only the objects and properties the machine actuator reads or writes are
//! modelled. Open-typed server payloads (devices, backings, groups) are closed
//! into enums here; [`crate::wire`] maps them to and from the VI/JSON encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to a server-side managed object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedObjectReference {
    /// Managed object type, e.g. `VirtualMachine`
    #[serde(rename = "type")]
    pub type_: String,
    /// Server-assigned identifier, e.g. `vm-42`
    pub value: String,
}

impl ManagedObjectReference {
    /// Create a reference
    pub fn new(type_: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            value: value.into(),
        }
    }

    /// Reference to a task by id
    pub fn task(value: impl Into<String>) -> Self {
        Self::new("Task", value)
    }

    /// Whether the reference is of the given type
    pub fn is(&self, type_: &str) -> bool {
        self.type_ == type_
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_, self.value)
    }
}

/// Short alias used throughout the crate
pub type MoRef = ManagedObjectReference;

/// Datacenter with its well-known child folders
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datacenter {
    /// Datacenter reference
    pub reference: MoRef,
    /// Datacenter name
    pub name: String,
    /// Inventory path, e.g. `/DC0`
    pub path: String,
    /// Root of the VM and template tree
    pub vm_folder: MoRef,
    /// Root of the host and cluster tree
    pub host_folder: MoRef,
    /// Root of the datastore tree
    pub datastore_folder: MoRef,
    /// Root of the network tree
    pub network_folder: MoRef,
}

/// Name and parent of any managed entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedEntity {
    /// Entity reference
    pub reference: MoRef,
    /// Display name
    pub name: String,
    /// Parent in the inventory tree; `None` at the root folder
    pub parent: Option<MoRef>,
}

/// VM power state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    /// Running
    PoweredOn,
    /// Stopped
    PoweredOff,
    /// Suspended to disk
    Suspended,
}

/// Task lifecycle state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Waiting to run
    Queued,
    /// In progress
    Running,
    /// Completed without error
    Success,
    /// Completed with error
    Error,
    /// Any state this client does not know
    #[serde(other)]
    Unknown,
}

/// Error attached to a failed task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalizedMethodFault {
    /// Fault type name, when reported
    pub fault: Option<String>,
    /// Human-readable message
    pub localized_message: String,
}

/// Snapshot of a task's state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task reference
    pub task: MoRef,
    /// Operation identifier, e.g. `VirtualMachine.clone`
    pub description_id: String,
    /// Object the task operates on
    pub entity: Option<MoRef>,
    /// Current state
    pub state: TaskState,
    /// Error, set when `state` is `Error`
    pub error: Option<LocalizedMethodFault>,
    /// Result object, e.g. the new VM of a clone
    pub result: Option<MoRef>,
}

/// Backing of a virtual ethernet card
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkBacking {
    /// Standard port group
    Network {
        /// Network name
        device_name: String,
        /// Network reference
        network: MoRef,
    },
    /// Distributed port group
    DistributedPortgroup {
        /// UUID of the distributed switch
        switch_uuid: String,
        /// Port group key
        portgroup_key: String,
    },
}

/// A network reachable from a compute cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Network {
    /// Network reference
    pub reference: MoRef,
    /// Network name
    pub name: String,
    /// Backing to use for a NIC attached to this network
    pub backing: NetworkBacking,
}

/// A virtual disk
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VirtualDisk {
    /// Device key; negative for devices not yet created
    pub key: i32,
    /// Key of the controller the disk hangs off
    pub controller_key: i32,
    /// Unit number on the controller
    pub unit_number: Option<i32>,
    /// Capacity in KiB
    pub capacity_in_kb: i64,
    /// Backing file, e.g. `[LocalDS_0] worker-0/worker-0.vmdk`; empty for new disks
    pub file_name: String,
    /// Thin provisioning; server default when unset
    pub thin_provisioned: Option<bool>,
    /// Zero the backing eagerly; server default when unset
    pub eagerly_scrub: Option<bool>,
}

/// A virtual ethernet card
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualEthernetCard {
    /// Device key
    pub key: i32,
    /// Adapter type, e.g. `vmxnet3`
    pub adapter: String,
    /// MAC address, assigned by the server
    pub mac_address: Option<String>,
    /// Network backing
    pub backing: NetworkBacking,
}

/// A SCSI controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiController {
    /// Device key
    pub key: i32,
    /// Bus number
    pub bus_number: i32,
    /// Unit number the controller itself occupies on its bus
    pub scsi_ctlr_unit_number: i32,
}

/// A device attached to a VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VirtualDevice {
    /// Virtual disk
    Disk(VirtualDisk),
    /// Ethernet card
    Ethernet(VirtualEthernetCard),
    /// SCSI controller
    ScsiController(ScsiController),
    /// Anything else, kept for completeness
    Other {
        /// Device key
        key: i32,
        /// Server type name
        type_name: String,
    },
}

impl VirtualDevice {
    /// Device key
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::Ethernet(e) => e.key,
            VirtualDevice::ScsiController(c) => c.key,
            VirtualDevice::Other { key, .. } => *key,
        }
    }

    /// The device as a disk
    pub fn as_disk(&self) -> Option<&VirtualDisk> {
        match self {
            VirtualDevice::Disk(d) => Some(d),
            _ => None,
        }
    }
}

/// Device change operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceOperation {
    /// Attach a new device
    Add,
    /// Modify an existing device
    Edit,
    /// Detach a device
    Remove,
}

/// Backing file operation accompanying a device change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOperation {
    /// Create the backing file
    Create,
    /// Delete the backing file
    Destroy,
}

/// One entry of a VM config spec's `deviceChange`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceChange {
    /// Operation
    pub operation: DeviceOperation,
    /// File operation, for disks
    pub file_operation: Option<FileOperation>,
    /// Target device
    pub device: VirtualDevice,
}

impl DeviceChange {
    /// Add a device
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: None,
            device,
        }
    }

    /// Add a disk and create its backing file
    pub fn create(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: Some(FileOperation::Create),
            device,
        }
    }

    /// Edit a device
    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            file_operation: None,
            device,
        }
    }

    /// Remove a device, keeping any backing file
    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: None,
            device,
        }
    }
}

/// Key/value guest option (extraConfig)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptionValue {
    /// Option key
    pub key: String,
    /// Option value
    pub value: String,
}

impl OptionValue {
    /// Create an option
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// VM configuration change
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VmConfigSpec {
    /// Virtual CPUs
    pub num_cpus: Option<i32>,
    /// Cores per socket
    pub num_cores_per_socket: Option<i32>,
    /// Memory in MiB
    pub memory_mb: Option<i64>,
    /// Instance UUID to assign
    pub instance_uuid: Option<String>,
    /// Expose disk UUIDs to the guest
    pub disk_uuid_enabled: Option<bool>,
    /// Guest options
    pub extra_config: Vec<OptionValue>,
    /// Device changes
    pub device_change: Vec<DeviceChange>,
}

/// Disk handling during relocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskMoveType {
    /// Full copy of every disk, consolidating delta chains
    MoveAllDiskBackingsAndConsolidate,
    /// Child delta disks on top of the source snapshot (linked clone)
    CreateNewChildDiskBacking,
}

/// Placement of a cloned VM
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RelocateSpec {
    /// Target datastore
    pub datastore: Option<MoRef>,
    /// Target resource pool
    pub pool: Option<MoRef>,
    /// Disk handling; full copy when unset
    pub disk_move_type: Option<DiskMoveType>,
}

/// Clone request
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CloneSpec {
    /// Placement
    pub location: RelocateSpec,
    /// Mark the clone as a template
    pub template: bool,
    /// Configuration applied to the clone
    pub config: VmConfigSpec,
    /// Power the clone on when done
    pub power_on: bool,
    /// Source snapshot, required for linked clones
    pub snapshot: Option<MoRef>,
}

/// Guest-reported NIC state
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct GuestNicInfo {
    /// MAC address
    pub mac_address: Option<String>,
    /// Addresses reported by guest tools
    pub ip_addresses: Vec<String>,
    /// Network name
    pub network: Option<String>,
    /// Whether the NIC is connected
    pub connected: bool,
}

/// Node of a VM's snapshot tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotTree {
    /// Snapshot name
    pub name: String,
    /// Snapshot reference
    pub snapshot: MoRef,
    /// Child snapshots
    pub children: Vec<SnapshotTree>,
}

/// A VM's snapshots
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SnapshotInfo {
    /// Snapshot the VM currently runs on
    pub current_snapshot: Option<MoRef>,
    /// Root snapshots
    pub root_snapshot_list: Vec<SnapshotTree>,
}

impl SnapshotInfo {
    /// Depth-first search for a snapshot by name
    pub fn find_by_name(&self, name: &str) -> Option<&SnapshotTree> {
        fn walk<'a>(nodes: &'a [SnapshotTree], name: &str) -> Option<&'a SnapshotTree> {
            nodes.iter().find_map(|node| {
                if node.name == name {
                    Some(node)
                } else {
                    walk(&node.children, name)
                }
            })
        }
        walk(&self.root_snapshot_list, name)
    }
}

/// Properties of a VM the actuator reads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmProperties {
    /// VM reference
    pub reference: MoRef,
    /// Display name
    pub name: String,
    /// BIOS UUID, used for the provider ID
    pub uuid: String,
    /// vCenter instance UUID
    pub instance_uuid: String,
    /// Hardware version, e.g. `vmx-15`
    pub version: String,
    /// Power state
    pub power_state: PowerState,
    /// Attached devices
    pub devices: Vec<VirtualDevice>,
    /// Guest NIC state
    pub guest_nics: Vec<GuestNicInfo>,
    /// Snapshots, when any exist
    pub snapshot: Option<SnapshotInfo>,
    /// Host the VM runs on
    pub host: Option<MoRef>,
    /// Resource pool the VM belongs to
    pub resource_pool: Option<MoRef>,
}

impl VmProperties {
    /// All virtual disks
    pub fn disks(&self) -> Vec<&VirtualDisk> {
        self.devices.iter().filter_map(VirtualDevice::as_disk).collect()
    }

    /// All ethernet cards
    pub fn ethernet_cards(&self) -> Vec<&VirtualEthernetCard> {
        self.devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::Ethernet(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Controller with the given key
    pub fn scsi_controller(&self, key: i32) -> Option<&ScsiController> {
        self.devices.iter().find_map(|d| match d {
            VirtualDevice::ScsiController(c) if c.key == key => Some(c),
            _ => None,
        })
    }
}

/// VM group inside a compute cluster
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterVmGroup {
    /// Group name
    pub name: String,
    /// Member VMs
    pub vm: Vec<MoRef>,
}

/// Host group inside a compute cluster
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterHostGroup {
    /// Group name
    pub name: String,
    /// Member hosts
    pub host: Vec<MoRef>,
}

/// Any group of a compute cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterGroup {
    /// VM group
    Vm(ClusterVmGroup),
    /// Host group
    Host(ClusterHostGroup),
}

/// Subset of a cluster's extended configuration
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterConfigInfo {
    /// Configured groups
    pub groups: Vec<ClusterGroup>,
}

impl ClusterConfigInfo {
    /// VM group with the given name
    pub fn vm_group(&self, name: &str) -> Option<&ClusterVmGroup> {
        self.groups.iter().find_map(|g| match g {
            ClusterGroup::Vm(vm) if vm.name == name => Some(vm),
            _ => None,
        })
    }
}

/// Array edit operation on cluster configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayOperation {
    /// Add an element
    Add,
    /// Replace an element
    Edit,
    /// Remove an element
    Remove,
}

/// One group change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterGroupSpec {
    /// Operation
    pub operation: ArrayOperation,
    /// New group state
    pub info: ClusterVmGroup,
}

/// Cluster reconfiguration
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ClusterConfigSpec {
    /// Group changes
    pub group_spec: Vec<ClusterGroupSpec>,
}

/// Tag as returned by the tagging service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag id, `urn:vmomi:InventoryServiceTag:...`
    pub id: String,
    /// Tag name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Owning category id
    pub category_id: String,
}

/// Tag category as returned by the tagging service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category id
    pub id: String,
    /// Category name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// `SINGLE` or `MULTIPLE`
    #[serde(default)]
    pub cardinality: String,
    /// Object types tags of this category may be attached to
    #[serde(default)]
    pub associable_types: Vec<String>,
}
