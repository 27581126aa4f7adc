//! In-memory vCenter
//!
//! Serves both [`VimClient`] and [`RestClient`] from one shared inventory so
//! actuator tests can run whole lifecycles without a server. The inventory
//! mirrors the default single-host simulator layout: datacenter `DC0`, cluster
//! `DC0_C0` with host `DC0_C0_H0`, datastore `LocalDS_0`, networks
//! `VM Network` and `DC0_DVPG0`, and template `DC0_H0_VM0`.
//!
//! Clone, power and destroy tasks stay running until [`Simulator::complete_tasks`]
//! runs them, unless auto-completion is switched on. Reconfigure tasks complete
//! immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::rest::RestClient;
use crate::session::{Connector, SessionParams};
use crate::types::{
    ArrayOperation, Category, CloneSpec, ClusterConfigInfo, ClusterConfigSpec, ClusterGroup,
    ClusterHostGroup, ClusterVmGroup, Datacenter, DeviceOperation, DiskMoveType, GuestNicInfo,
    LocalizedMethodFault, ManagedEntity, MoRef, Network, NetworkBacking, PowerState,
    ScsiController, SnapshotInfo, SnapshotTree, Tag, TaskInfo, TaskState, VirtualDevice,
    VirtualDisk, VirtualEthernetCard, VmConfigSpec, VmProperties,
};
use crate::vim::VimClient;

/// User accepted by the simulator's login
pub const SIM_USERNAME: &str = "user";

/// Password accepted by the simulator's login
pub const SIM_PASSWORD: &str = "s3cr3t-sim";

/// Description id of clone tasks
pub const CLONE_TASK: &str = "VirtualMachine.cloneVM";
/// Description id of power-on tasks
pub const POWER_ON_TASK: &str = "VirtualMachine.powerOn";
/// Description id of power-off tasks
pub const POWER_OFF_TASK: &str = "VirtualMachine.powerOff";
/// Description id of destroy tasks
pub const DESTROY_TASK: &str = "VirtualMachine.destroy";
/// Description id of VM reconfigure tasks
pub const RECONFIGURE_TASK: &str = "VirtualMachine.reconfigure";
/// Description id of cluster reconfigure tasks
pub const CLUSTER_RECONFIGURE_TASK: &str = "ClusterComputeResource.reconfigureEx";

/// Name of the template VM
pub const TEMPLATE_NAME: &str = "DC0_H0_VM0";
/// Capacity of the template's only disk
pub const TEMPLATE_DISK_KB: i64 = 10 * 1024 * 1024;

const DATASTORE_NAME: &str = "LocalDS_0";
const DVS_UUID: &str = "fe b5 1c 50 6b 4b 3b 2a-5a 7a 39 bd 04 e1 c6 61";

const ROOT: &str = "group-d1";
const DATACENTER: &str = "datacenter-2";
const VM_FOLDER: &str = "group-v3";
const HOST_FOLDER: &str = "group-h4";
const DATASTORE_FOLDER: &str = "group-s5";
const NETWORK_FOLDER: &str = "group-n6";
const CLUSTER: &str = "domain-c7";
const RESOURCE_POOL: &str = "resgroup-8";
const HOST: &str = "host-9";
const DATASTORE: &str = "datastore-10";
const NETWORK: &str = "network-11";
const DVS: &str = "dvs-12";
const PORTGROUP: &str = "dvportgroup-13";
const TEMPLATE: &str = "vm-14";
const TEMPLATE_SNAPSHOT: &str = "snapshot-15";

/// A clone request as received
#[derive(Clone, Debug)]
pub struct CloneRequest {
    /// Source VM
    pub template: MoRef,
    /// Target folder
    pub folder: MoRef,
    /// New VM name
    pub name: String,
    /// Clone spec
    pub spec: CloneSpec,
}

#[derive(Clone, Debug)]
struct Entity {
    type_: String,
    name: String,
    parent: Option<MoRef>,
}

#[derive(Clone, Debug)]
enum PendingAction {
    Clone(CloneRequest),
    PowerOn(MoRef),
    PowerOff(MoRef),
    Destroy(MoRef),
}

#[derive(Debug)]
struct SimTask {
    info: TaskInfo,
    pending: Option<PendingAction>,
}

fn fault(name: &str, message: impl Into<String>) -> LocalizedMethodFault {
    LocalizedMethodFault {
        fault: Some(name.to_string()),
        localized_message: message.into(),
    }
}

#[derive(Debug)]
struct State {
    generation: u64,
    logins: usize,
    auto_complete: bool,
    next_id: u64,
    next_mac: u32,
    entities: BTreeMap<String, Entity>,
    vms: BTreeMap<String, VmProperties>,
    networks: Vec<Network>,
    groups: Vec<ClusterGroup>,
    tasks: Vec<SimTask>,
    tags: BTreeMap<String, Tag>,
    categories: BTreeMap<String, Category>,
    attachments: Vec<(String, MoRef)>,
    rest_calls: HashMap<String, usize>,
    clone_requests: Vec<CloneRequest>,
    reconfigure_requests: Vec<(MoRef, VmConfigSpec)>,
}

impl State {
    fn new() -> Self {
        let mut state = Self {
            generation: 0,
            logins: 0,
            auto_complete: false,
            next_id: 99,
            next_mac: 0,
            entities: BTreeMap::new(),
            vms: BTreeMap::new(),
            networks: Vec::new(),
            groups: Vec::new(),
            tasks: Vec::new(),
            tags: BTreeMap::new(),
            categories: BTreeMap::new(),
            attachments: Vec::new(),
            rest_calls: HashMap::new(),
            clone_requests: Vec::new(),
            reconfigure_requests: Vec::new(),
        };

        let inventory: &[(&str, &str, &str, Option<(&str, &str)>)] = &[
            (ROOT, "Folder", "Datacenters", None),
            (DATACENTER, "Datacenter", "DC0", Some(("Folder", ROOT))),
            (VM_FOLDER, "Folder", "vm", Some(("Datacenter", DATACENTER))),
            (HOST_FOLDER, "Folder", "host", Some(("Datacenter", DATACENTER))),
            (DATASTORE_FOLDER, "Folder", "datastore", Some(("Datacenter", DATACENTER))),
            (NETWORK_FOLDER, "Folder", "network", Some(("Datacenter", DATACENTER))),
            (CLUSTER, "ClusterComputeResource", "DC0_C0", Some(("Folder", HOST_FOLDER))),
            (RESOURCE_POOL, "ResourcePool", "Resources", Some(("ClusterComputeResource", CLUSTER))),
            (HOST, "HostSystem", "DC0_C0_H0", Some(("ClusterComputeResource", CLUSTER))),
            (DATASTORE, "Datastore", DATASTORE_NAME, Some(("Folder", DATASTORE_FOLDER))),
            (NETWORK, "Network", "VM Network", Some(("Folder", NETWORK_FOLDER))),
            (DVS, "VmwareDistributedVirtualSwitch", "DC0_DVS", Some(("Folder", NETWORK_FOLDER))),
            (PORTGROUP, "DistributedVirtualPortgroup", "DC0_DVPG0", Some(("Folder", NETWORK_FOLDER))),
            (TEMPLATE, "VirtualMachine", TEMPLATE_NAME, Some(("Folder", VM_FOLDER))),
        ];
        for (id, type_, name, parent) in inventory {
            state.entities.insert(
                id.to_string(),
                Entity {
                    type_: type_.to_string(),
                    name: name.to_string(),
                    parent: parent.map(|(t, v)| MoRef::new(t, v)),
                },
            );
        }

        state.networks = vec![
            Network {
                reference: MoRef::new("Network", NETWORK),
                name: "VM Network".to_string(),
                backing: NetworkBacking::Network {
                    device_name: "VM Network".to_string(),
                    network: MoRef::new("Network", NETWORK),
                },
            },
            Network {
                reference: MoRef::new("DistributedVirtualPortgroup", PORTGROUP),
                name: "DC0_DVPG0".to_string(),
                backing: NetworkBacking::DistributedPortgroup {
                    switch_uuid: DVS_UUID.to_string(),
                    portgroup_key: PORTGROUP.to_string(),
                },
            },
        ];

        state.groups = vec![ClusterGroup::Host(ClusterHostGroup {
            name: "DC0_C0_hosts".to_string(),
            host: vec![MoRef::new("HostSystem", HOST)],
        })];

        let mac = state.mac();
        state.vms.insert(
            TEMPLATE.to_string(),
            VmProperties {
                reference: MoRef::new("VirtualMachine", TEMPLATE),
                name: TEMPLATE_NAME.to_string(),
                uuid: "265104de-1472-547c-b873-6dc7883fb6cb".to_string(),
                instance_uuid: "b4689bed-97f0-5bcd-8a4c-07477cc8f06f".to_string(),
                version: "vmx-15".to_string(),
                power_state: PowerState::PoweredOff,
                devices: vec![
                    VirtualDevice::ScsiController(ScsiController {
                        key: 1000,
                        bus_number: 0,
                        scsi_ctlr_unit_number: 7,
                    }),
                    VirtualDevice::Disk(VirtualDisk {
                        key: 2000,
                        controller_key: 1000,
                        unit_number: Some(0),
                        capacity_in_kb: TEMPLATE_DISK_KB,
                        file_name: format!("[{DATASTORE_NAME}] {TEMPLATE_NAME}/disk1.vmdk"),
                        thin_provisioned: Some(true),
                        eagerly_scrub: None,
                    }),
                    VirtualDevice::Ethernet(VirtualEthernetCard {
                        key: 4000,
                        adapter: "VirtualE1000".to_string(),
                        mac_address: Some(mac),
                        backing: NetworkBacking::Network {
                            device_name: "VM Network".to_string(),
                            network: MoRef::new("Network", NETWORK),
                        },
                    }),
                ],
                guest_nics: Vec::new(),
                snapshot: Some(SnapshotInfo {
                    current_snapshot: Some(MoRef::new("VirtualMachineSnapshot", TEMPLATE_SNAPSHOT)),
                    root_snapshot_list: vec![SnapshotTree {
                        name: "root".to_string(),
                        snapshot: MoRef::new("VirtualMachineSnapshot", TEMPLATE_SNAPSHOT),
                        children: Vec::new(),
                    }],
                }),
                host: Some(MoRef::new("HostSystem", HOST)),
                resource_pool: Some(MoRef::new("ResourcePool", RESOURCE_POOL)),
            },
        );

        state
    }

    fn next_ref(&mut self, type_: &str, prefix: &str) -> MoRef {
        self.next_id += 1;
        MoRef::new(type_, format!("{prefix}-{}", self.next_id))
    }

    fn mac(&mut self) -> String {
        self.next_mac += 1;
        let n = self.next_mac;
        format!(
            "00:50:56:{:02x}:{:02x}:{:02x}",
            (n >> 16) & 0xff,
            (n >> 8) & 0xff,
            n & 0xff
        )
    }

    fn entity(&self, reference: &MoRef) -> Result<&Entity> {
        self.entities
            .get(&reference.value)
            .filter(|e| e.type_ == reference.type_)
            .ok_or_else(|| Error::managed_object_not_found(reference.to_string()))
    }

    fn reference(&self, id: &str) -> Option<MoRef> {
        self.entities
            .get(id)
            .map(|e| MoRef::new(e.type_.clone(), id))
    }

    fn path(&self, id: &str) -> String {
        let mut names = Vec::new();
        let mut current = self.entities.get(id);
        while let Some(entity) = current {
            let Some(parent) = &entity.parent else { break };
            names.push(entity.name.clone());
            current = self.entities.get(&parent.value);
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    fn is_under(&self, id: &str, container: &str) -> bool {
        let mut current = self.entities.get(id).and_then(|e| e.parent.clone());
        while let Some(parent) = current {
            if parent.value == container {
                return true;
            }
            current = self.entities.get(&parent.value).and_then(|e| e.parent.clone());
        }
        false
    }

    fn find(
        &self,
        kind: &str,
        type_: &str,
        container: &MoRef,
        relative_root: &str,
        path: &str,
    ) -> Result<MoRef> {
        let candidates = self
            .entities
            .iter()
            .filter(|(id, e)| e.type_ == type_ && self.is_under(id, &container.value));

        let matches: Vec<MoRef> = if path.contains('/') {
            let full = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("{relative_root}/{path}")
            };
            candidates
                .filter(|(id, _)| self.path(id) == full)
                .map(|(id, e)| MoRef::new(e.type_.clone(), id.clone()))
                .collect()
        } else {
            candidates
                .filter(|(_, e)| e.name == path)
                .map(|(id, e)| MoRef::new(e.type_.clone(), id.clone()))
                .collect()
        };
        single(kind, path, matches)
    }

    fn datacenter(&self, id: &str) -> Result<Datacenter> {
        let reference = MoRef::new("Datacenter", id);
        let entity = self.entity(&reference)?;
        let folder = |name: &str| {
            self.entities
                .iter()
                .find(|(_, e)| {
                    e.type_ == "Folder"
                        && e.name == name
                        && e.parent.as_ref().is_some_and(|p| p.value == id)
                })
                .map(|(fid, _)| MoRef::new("Folder", fid.clone()))
                .ok_or_else(|| Error::not_found("folder", name))
        };
        Ok(Datacenter {
            name: entity.name.clone(),
            path: self.path(id),
            vm_folder: folder("vm")?,
            host_folder: folder("host")?,
            datastore_folder: folder("datastore")?,
            network_folder: folder("network")?,
            reference,
        })
    }

    fn vm(&self, vm: &MoRef) -> Result<&VmProperties> {
        self.vms
            .get(&vm.value)
            .ok_or_else(|| Error::managed_object_not_found(vm.to_string()))
    }

    fn vm_mut(&mut self, vm: &MoRef) -> Result<&mut VmProperties> {
        self.vms
            .get_mut(&vm.value)
            .ok_or_else(|| Error::managed_object_not_found(vm.to_string()))
    }

    fn start_task(
        &mut self,
        description_id: &str,
        entity: &MoRef,
        pending: Option<PendingAction>,
    ) -> MoRef {
        let task = self.next_ref("Task", "task");
        let state = if pending.is_some() {
            TaskState::Running
        } else {
            TaskState::Success
        };
        self.tasks.push(SimTask {
            info: TaskInfo {
                task: task.clone(),
                description_id: description_id.to_string(),
                entity: Some(entity.clone()),
                state,
                error: None,
                result: None,
            },
            pending,
        });
        if self.auto_complete {
            self.complete(self.tasks.len() - 1);
        }
        task
    }

    fn complete(&mut self, index: usize) {
        let Some(action) = self.tasks[index].pending.take() else {
            return;
        };
        let outcome = self.run(action);
        let info = &mut self.tasks[index].info;
        match outcome {
            Ok(result) => {
                info.state = TaskState::Success;
                info.result = result;
            }
            Err(error) => {
                info.state = TaskState::Error;
                info.error = Some(error);
            }
        }
    }

    fn run(&mut self, action: PendingAction) -> std::result::Result<Option<MoRef>, LocalizedMethodFault> {
        let gone = |vm: &MoRef| {
            fault(
                "ManagedObjectNotFound",
                format!("The object '{vm}' has already been deleted or has not been completely created"),
            )
        };
        match action {
            PendingAction::Clone(request) => self.finish_clone(request).map(Some),
            PendingAction::PowerOn(vm) => {
                let props = self.vm_mut(&vm).map_err(|_| gone(&vm))?;
                props.power_state = PowerState::PoweredOn;
                Ok(None)
            }
            PendingAction::PowerOff(vm) => {
                let props = self.vm_mut(&vm).map_err(|_| gone(&vm))?;
                props.power_state = PowerState::PoweredOff;
                Ok(None)
            }
            PendingAction::Destroy(vm) => {
                let props = self.vm(&vm).map_err(|_| gone(&vm))?;
                if props.power_state == PowerState::PoweredOn {
                    return Err(fault(
                        "InvalidPowerState",
                        "The attempted operation cannot be performed in the current state (Powered on).",
                    ));
                }
                self.vms.remove(&vm.value);
                self.entities.remove(&vm.value);
                self.attachments.retain(|(_, object)| object != &vm);
                for group in &mut self.groups {
                    if let ClusterGroup::Vm(g) = group {
                        g.vm.retain(|member| member != &vm);
                    }
                }
                Ok(None)
            }
        }
    }

    fn finish_clone(&mut self, request: CloneRequest) -> std::result::Result<MoRef, LocalizedMethodFault> {
        let template = self
            .vms
            .get(&request.template.value)
            .cloned()
            .ok_or_else(|| fault("ManagedObjectNotFound", format!("template {} is gone", request.template)))?;

        let linked = request.spec.location.disk_move_type
            == Some(DiskMoveType::CreateNewChildDiskBacking);
        if linked && request.spec.snapshot.is_none() {
            return Err(fault(
                "InvalidArgument",
                "A specified parameter was not correct: spec.snapshot",
            ));
        }
        if self.vms.values().any(|vm| vm.name == request.name) {
            return Err(fault(
                "DuplicateName",
                format!("The name '{}' already exists.", request.name),
            ));
        }

        let vm = self.next_ref("VirtualMachine", "vm");
        let name = request.name.clone();
        let mut props = template;
        props.reference = vm.clone();
        props.name = name.clone();
        props.uuid = uuid::Uuid::new_v4().to_string();
        props.instance_uuid = request
            .spec
            .config
            .instance_uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        props.power_state = if request.spec.power_on {
            PowerState::PoweredOn
        } else {
            PowerState::PoweredOff
        };
        props.snapshot = None;
        props.guest_nics = Vec::new();
        if let Some(pool) = &request.spec.location.pool {
            props.resource_pool = Some(pool.clone());
        }
        let mut disk_index = 0;
        for device in &mut props.devices {
            if let VirtualDevice::Disk(disk) = device {
                disk.file_name = disk_file(&name, disk_index);
                disk_index += 1;
            }
        }

        self.entities.insert(
            vm.value.clone(),
            Entity {
                type_: "VirtualMachine".to_string(),
                name,
                parent: Some(request.folder.clone()),
            },
        );
        self.vms.insert(vm.value.clone(), props);
        self.apply_config(&vm, &request.spec.config);
        Ok(vm)
    }

    fn apply_config(&mut self, vm: &MoRef, spec: &VmConfigSpec) {
        let Some(mut props) = self.vms.remove(&vm.value) else {
            return;
        };
        for change in &spec.device_change {
            match change.operation {
                DeviceOperation::Remove => {
                    let key = change.device.key();
                    props.devices.retain(|d| d.key() != key);
                }
                DeviceOperation::Edit => {
                    let key = change.device.key();
                    if let Some(existing) = props.devices.iter_mut().find(|d| d.key() == key) {
                        *existing = change.device.clone();
                    }
                }
                DeviceOperation::Add => {
                    let mut device = change.device.clone();
                    let key = props.devices.iter().map(VirtualDevice::key).max().unwrap_or(0) + 1;
                    match &mut device {
                        VirtualDevice::Disk(disk) => {
                            disk.key = key;
                            if disk.file_name.is_empty() {
                                let index = props.disks().len();
                                disk.file_name = disk_file(&props.name, index);
                            }
                        }
                        VirtualDevice::Ethernet(nic) => {
                            nic.key = key;
                            if nic.mac_address.is_none() {
                                nic.mac_address = Some(self.mac());
                            }
                        }
                        VirtualDevice::ScsiController(ctrl) => ctrl.key = key,
                        VirtualDevice::Other { key: k, .. } => *k = key,
                    }
                    props.devices.push(device);
                }
            }
        }
        self.vms.insert(vm.value.clone(), props);
    }
}

fn disk_file(vm_name: &str, index: usize) -> String {
    if index == 0 {
        format!("[{DATASTORE_NAME}] {vm_name}/{vm_name}.vmdk")
    } else {
        format!("[{DATASTORE_NAME}] {vm_name}/{vm_name}_{index}.vmdk")
    }
}

fn single(kind: &str, name: &str, mut matches: Vec<MoRef>) -> Result<MoRef> {
    match matches.len() {
        0 => Err(Error::not_found(kind, name)),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::multiple_found(kind, name)),
    }
}

/// Handle to the in-memory vCenter
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<State>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Create a simulator with the default inventory
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Run lifecycle tasks as soon as they start
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// A client bound to the current session generation
    pub fn session(&self) -> SimulatorSession {
        SimulatorSession {
            state: self.state.clone(),
            generation: self.state.lock().generation,
        }
    }

    /// Number of successful logins
    pub fn login_count(&self) -> usize {
        self.state.lock().logins
    }

    /// Invalidate every session handed out so far
    pub fn expire_sessions(&self) {
        self.state.lock().generation += 1;
    }

    /// The template VM
    pub fn template(&self) -> MoRef {
        MoRef::new("VirtualMachine", TEMPLATE)
    }

    /// The compute cluster
    pub fn cluster(&self) -> MoRef {
        MoRef::new("ClusterComputeResource", CLUSTER)
    }

    /// The cluster's only host
    pub fn host(&self) -> MoRef {
        MoRef::new("HostSystem", HOST)
    }

    /// The datacenter's host folder, parent of the cluster
    pub fn host_folder(&self) -> MoRef {
        MoRef::new("Folder", HOST_FOLDER)
    }

    /// The datacenter
    pub fn datacenter(&self) -> MoRef {
        MoRef::new("Datacenter", DATACENTER)
    }

    /// Add a datastore next to `LocalDS_0`
    pub fn add_datastore(&self, name: &str) -> MoRef {
        let mut state = self.state.lock();
        let datastore = state.next_ref("Datastore", "datastore");
        state.entities.insert(
            datastore.value.clone(),
            Entity {
                type_: "Datastore".to_string(),
                name: name.to_string(),
                parent: Some(MoRef::new("Folder", DATASTORE_FOLDER)),
            },
        );
        datastore
    }

    /// Copy the template into a new VM folder `folder`, keeping its name
    pub fn add_template_copy(&self, folder: &str) -> MoRef {
        let mut state = self.state.lock();
        let folder_ref = state.next_ref("Folder", "group-v");
        state.entities.insert(
            folder_ref.value.clone(),
            Entity {
                type_: "Folder".to_string(),
                name: folder.to_string(),
                parent: Some(MoRef::new("Folder", VM_FOLDER)),
            },
        );
        let vm = state.next_ref("VirtualMachine", "vm");
        let mut props = match state.vms.get(TEMPLATE) {
            Some(template) => template.clone(),
            None => panic!("simulator template {TEMPLATE} is gone"),
        };
        props.reference = vm.clone();
        props.uuid = uuid::Uuid::new_v4().to_string();
        props.instance_uuid = uuid::Uuid::new_v4().to_string();
        state.entities.insert(
            vm.value.clone(),
            Entity {
                type_: "VirtualMachine".to_string(),
                name: TEMPLATE_NAME.to_string(),
                parent: Some(folder_ref),
            },
        );
        state.vms.insert(vm.value.clone(), props);
        vm
    }

    /// Run every running task to completion, returning how many ran
    pub fn complete_tasks(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<usize> = state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.pending.is_some())
            .map(|(i, _)| i)
            .collect();
        for index in &pending {
            state.complete(*index);
        }
        pending.len()
    }

    /// Fail a running task with `message`
    pub fn fail_task(&self, task: &MoRef, message: &str) {
        let mut state = self.state.lock();
        if let Some(t) = state.tasks.iter_mut().find(|t| &t.info.task == task) {
            t.pending = None;
            t.info.state = TaskState::Error;
            t.info.error = Some(fault("SystemError", message));
        }
    }

    /// Drop a task as the server does after garbage collection
    pub fn forget_task(&self, task: &MoRef) {
        self.state.lock().tasks.retain(|t| &t.info.task != task);
    }

    /// Info of every task still known, oldest first
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.state.lock().tasks.iter().map(|t| t.info.clone()).collect()
    }

    /// Tasks with the given description id
    pub fn tasks_named(&self, description_id: &str) -> Vec<TaskInfo> {
        self.tasks()
            .into_iter()
            .filter(|t| t.description_id == description_id)
            .collect()
    }

    /// Clone requests received so far
    pub fn clone_requests(&self) -> Vec<CloneRequest> {
        self.state.lock().clone_requests.clone()
    }

    /// VM reconfigure requests received so far
    pub fn reconfigure_requests(&self) -> Vec<(MoRef, VmConfigSpec)> {
        self.state.lock().reconfigure_requests.clone()
    }

    /// Look a VM up by name
    pub fn vm_by_name(&self, name: &str) -> Option<MoRef> {
        self.state
            .lock()
            .vms
            .values()
            .find(|vm| vm.name == name)
            .map(|vm| vm.reference.clone())
    }

    /// Look a VM up by instance UUID
    pub fn vm_by_instance_uuid(&self, uuid: &str) -> Option<MoRef> {
        self.state
            .lock()
            .vms
            .values()
            .find(|vm| vm.instance_uuid == uuid)
            .map(|vm| vm.reference.clone())
    }

    /// Current properties of a VM
    pub fn vm(&self, vm: &MoRef) -> Option<VmProperties> {
        self.state.lock().vms.get(&vm.value).cloned()
    }

    /// Clone the template synchronously into a new VM
    pub fn create_vm(&self, name: &str, instance_uuid: &str, power_state: PowerState) -> MoRef {
        let mut state = self.state.lock();
        let request = CloneRequest {
            template: MoRef::new("VirtualMachine", TEMPLATE),
            folder: MoRef::new("Folder", VM_FOLDER),
            name: name.to_string(),
            spec: CloneSpec {
                config: VmConfigSpec {
                    instance_uuid: Some(instance_uuid.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        };
        match state.finish_clone(request) {
            Ok(vm) => {
                if let Some(props) = state.vms.get_mut(&vm.value) {
                    props.power_state = power_state;
                }
                vm
            }
            Err(e) => panic!("simulator clone of {name} failed: {}", e.localized_message),
        }
    }

    /// Force a VM's power state
    pub fn set_power_state(&self, vm: &MoRef, power_state: PowerState) {
        if let Some(props) = self.state.lock().vms.get_mut(&vm.value) {
            props.power_state = power_state;
        }
    }

    /// Force a VM's hardware version
    pub fn set_version(&self, vm: &MoRef, version: &str) {
        if let Some(props) = self.state.lock().vms.get_mut(&vm.value) {
            props.version = version.to_string();
        }
    }

    /// Attach a disk backed by `file_name` on the first controller
    pub fn attach_disk(&self, vm: &MoRef, file_name: &str, capacity_in_kb: i64) {
        let mut state = self.state.lock();
        let Some(props) = state.vms.get_mut(&vm.value) else {
            return;
        };
        let Some(controller) = props.devices.iter().find_map(|d| match d {
            VirtualDevice::ScsiController(c) => Some(c.clone()),
            _ => None,
        }) else {
            return;
        };
        let used: Vec<i32> = props
            .disks()
            .iter()
            .filter(|d| d.controller_key == controller.key)
            .filter_map(|d| d.unit_number)
            .collect();
        let unit = (0..16)
            .find(|u| *u != controller.scsi_ctlr_unit_number && !used.contains(u))
            .unwrap_or(15);
        let key = props.devices.iter().map(VirtualDevice::key).max().unwrap_or(0) + 1;
        props.devices.push(VirtualDevice::Disk(VirtualDisk {
            key,
            controller_key: controller.key,
            unit_number: Some(unit),
            capacity_in_kb,
            file_name: file_name.to_string(),
            thin_provisioned: Some(true),
            eagerly_scrub: None,
        }));
    }

    /// Set what guest tools report for a VM's NICs
    pub fn set_guest_nics(&self, vm: &MoRef, nics: Vec<GuestNicInfo>) {
        if let Some(props) = self.state.lock().vms.get_mut(&vm.value) {
            props.guest_nics = nics;
        }
    }

    /// Members of a VM group, if the group exists
    pub fn vm_group(&self, name: &str) -> Option<Vec<MoRef>> {
        self.state.lock().groups.iter().find_map(|g| match g {
            ClusterGroup::Vm(vm) if vm.name == name => Some(vm.vm.clone()),
            _ => None,
        })
    }

    /// Create a VM group
    pub fn add_vm_group(&self, name: &str, vms: Vec<MoRef>) {
        self.state.lock().groups.push(ClusterGroup::Vm(ClusterVmGroup {
            name: name.to_string(),
            vm: vms,
        }));
    }

    /// Create a tag category and return its id
    pub fn create_category(&self, name: &str) -> String {
        let mut state = self.state.lock();
        insert_category(&mut state, name, "MULTIPLE")
    }

    /// Create a tag and return its id
    pub fn create_tag(&self, name: &str, category_id: &str) -> String {
        let mut state = self.state.lock();
        insert_tag(&mut state, name, category_id)
    }

    /// Delete a tag and its attachments
    pub fn delete_tag(&self, id: &str) {
        let mut state = self.state.lock();
        state.tags.remove(id);
        state.attachments.retain(|(tag, _)| tag != id);
    }

    /// Attach a tag to an object
    pub fn attach_tag(&self, id: &str, object: &MoRef) {
        let mut state = self.state.lock();
        let attachment = (id.to_string(), object.clone());
        if !state.attachments.contains(&attachment) {
            state.attachments.push(attachment);
        }
    }

    /// Number of REST calls of one kind, e.g. `list_tags`
    pub fn rest_calls(&self, method: &str) -> usize {
        self.state
            .lock()
            .rest_calls
            .get(method)
            .copied()
            .unwrap_or(0)
    }
}

fn insert_category(state: &mut State, name: &str, cardinality: &str) -> String {
    let id = format!("urn:vmomi:InventoryServiceCategory:{}:GLOBAL", uuid::Uuid::new_v4());
    state.categories.insert(
        id.clone(),
        Category {
            id: id.clone(),
            name: name.to_string(),
            description: String::new(),
            cardinality: cardinality.to_string(),
            associable_types: Vec::new(),
        },
    );
    id
}

fn insert_tag(state: &mut State, name: &str, category_id: &str) -> String {
    let id = format!("urn:vmomi:InventoryServiceTag:{}:GLOBAL", uuid::Uuid::new_v4());
    state.tags.insert(
        id.clone(),
        Tag {
            id: id.clone(),
            name: name.to_string(),
            description: String::new(),
            category_id: category_id.to_string(),
        },
    );
    id
}

#[async_trait]
impl Connector for Simulator {
    async fn connect(
        &self,
        params: &SessionParams,
    ) -> Result<(Arc<dyn VimClient>, Arc<dyn RestClient>)> {
        if params.username != SIM_USERNAME || params.password != SIM_PASSWORD {
            return Err(Error::not_authenticated(
                "Cannot complete login due to an incorrect user name or password.",
            ));
        }
        self.state.lock().logins += 1;
        let session = self.session();
        Ok((Arc::new(session.clone()), Arc::new(session)))
    }
}

/// One logged-in client of the simulator
#[derive(Clone)]
pub struct SimulatorSession {
    state: Arc<Mutex<State>>,
    generation: u64,
}

impl SimulatorSession {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock();
        if state.generation != self.generation {
            return Err(Error::not_authenticated("The session is not authenticated."));
        }
        Ok(state)
    }

    fn rest(&self, method: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock()?;
        *state.rest_calls.entry(method.to_string()).or_default() += 1;
        Ok(state)
    }
}

#[async_trait]
impl VimClient for SimulatorSession {
    async fn session_is_active(&self) -> Result<bool> {
        Ok(self.state.lock().generation == self.generation)
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn find_datacenter(&self, path: Option<&str>) -> Result<Datacenter> {
        let state = self.lock()?;
        let root = MoRef::new("Folder", ROOT);
        let datacenter = match path {
            None => {
                let all = state
                    .entities
                    .iter()
                    .filter(|(_, e)| e.type_ == "Datacenter")
                    .map(|(id, _)| MoRef::new("Datacenter", id.clone()))
                    .collect();
                single("datacenter", "*", all)?
            }
            Some(path) => {
                let path = path.trim_start_matches('/');
                state.find("datacenter", "Datacenter", &root, "", path)?
            }
        };
        state.datacenter(&datacenter.value)
    }

    async fn find_folder(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        let state = self.lock()?;
        match path {
            None => Ok(dc.vm_folder.clone()),
            Some(path) => state.find(
                "folder",
                "Folder",
                &dc.vm_folder,
                &format!("{}/vm", dc.path),
                path,
            ),
        }
    }

    async fn find_datastore(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        let state = self.lock()?;
        match path {
            None => {
                let all = state
                    .entities
                    .iter()
                    .filter(|(id, e)| e.type_ == "Datastore" && state.is_under(id, &dc.reference.value))
                    .map(|(id, _)| MoRef::new("Datastore", id.clone()))
                    .collect();
                single("datastore", "*", all)
            }
            Some(path) => state.find(
                "datastore",
                "Datastore",
                &dc.datastore_folder,
                &format!("{}/datastore", dc.path),
                path,
            ),
        }
    }

    async fn find_resource_pool(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        let state = self.lock()?;
        match path {
            None => {
                let roots = state
                    .entities
                    .iter()
                    .filter(|(id, e)| {
                        e.type_ == "ResourcePool"
                            && state.is_under(id, &dc.reference.value)
                            && e.parent.as_ref().is_some_and(|p| !p.is("ResourcePool"))
                    })
                    .map(|(id, _)| MoRef::new("ResourcePool", id.clone()))
                    .collect();
                single("resource pool", "*/Resources", roots)
            }
            Some(path) => state.find(
                "resource pool",
                "ResourcePool",
                &dc.host_folder,
                &format!("{}/host", dc.path),
                path,
            ),
        }
    }

    async fn find_virtual_machine(&self, dc: &Datacenter, path: &str) -> Result<MoRef> {
        let state = self.lock()?;
        state.find(
            "vm",
            "VirtualMachine",
            &dc.vm_folder,
            &format!("{}/vm", dc.path),
            path,
        )
    }

    async fn find_by_instance_uuid(&self, dc: &Datacenter, uuid: &str) -> Result<Option<MoRef>> {
        let state = self.lock()?;
        Ok(state
            .vms
            .values()
            .find(|vm| {
                vm.instance_uuid == uuid && state.is_under(&vm.reference.value, &dc.reference.value)
            })
            .map(|vm| vm.reference.clone()))
    }

    async fn vm_properties(&self, vm: &MoRef) -> Result<VmProperties> {
        self.lock()?.vm(vm).cloned()
    }

    async fn managed_entity(&self, obj: &MoRef) -> Result<ManagedEntity> {
        let state = self.lock()?;
        let entity = state.entity(obj)?;
        Ok(ManagedEntity {
            reference: obj.clone(),
            name: entity.name.clone(),
            parent: entity.parent.clone(),
        })
    }

    async fn resource_pool_owner(&self, pool: &MoRef) -> Result<MoRef> {
        let state = self.lock()?;
        let mut current = state.entity(pool)?.parent.clone();
        while let Some(parent) = current {
            if !parent.is("ResourcePool") {
                return Ok(parent);
            }
            current = state.entity(&parent)?.parent.clone();
        }
        Err(Error::not_found("compute resource", pool.to_string()))
    }

    async fn cluster_networks(&self, cluster: &MoRef) -> Result<Vec<Network>> {
        let state = self.lock()?;
        state.entity(cluster)?;
        Ok(state.networks.clone())
    }

    async fn cluster_configuration(&self, cluster: &MoRef) -> Result<ClusterConfigInfo> {
        let state = self.lock()?;
        state.entity(cluster)?;
        Ok(ClusterConfigInfo {
            groups: state.groups.clone(),
        })
    }

    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.vm(template)?;
        state.entity(folder)?;
        let request = CloneRequest {
            template: template.clone(),
            folder: folder.clone(),
            name: name.to_string(),
            spec: spec.clone(),
        };
        state.clone_requests.push(request.clone());
        Ok(state.start_task(CLONE_TASK, template, Some(PendingAction::Clone(request))))
    }

    async fn power_on(&self, vm: &MoRef) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.vm(vm)?;
        Ok(state.start_task(POWER_ON_TASK, vm, Some(PendingAction::PowerOn(vm.clone()))))
    }

    async fn power_off(&self, vm: &MoRef) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.vm(vm)?;
        Ok(state.start_task(POWER_OFF_TASK, vm, Some(PendingAction::PowerOff(vm.clone()))))
    }

    async fn destroy(&self, vm: &MoRef) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.vm(vm)?;
        Ok(state.start_task(DESTROY_TASK, vm, Some(PendingAction::Destroy(vm.clone()))))
    }

    async fn reconfigure_vm(&self, vm: &MoRef, spec: &VmConfigSpec) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.vm(vm)?;
        state.reconfigure_requests.push((vm.clone(), spec.clone()));
        state.apply_config(vm, spec);
        Ok(state.start_task(RECONFIGURE_TASK, vm, None))
    }

    async fn reconfigure_cluster(
        &self,
        cluster: &MoRef,
        spec: &ClusterConfigSpec,
    ) -> Result<MoRef> {
        let mut state = self.lock()?;
        state.entity(cluster)?;
        for change in &spec.group_spec {
            let name = change.info.name.clone();
            let position = state
                .groups
                .iter()
                .position(|g| matches!(g, ClusterGroup::Vm(vm) if vm.name == name));
            match (change.operation, position) {
                (ArrayOperation::Add, None) => {
                    state.groups.push(ClusterGroup::Vm(change.info.clone()));
                }
                (ArrayOperation::Edit, Some(i)) => {
                    state.groups[i] = ClusterGroup::Vm(change.info.clone());
                }
                (ArrayOperation::Remove, Some(i)) => {
                    state.groups.remove(i);
                }
                (ArrayOperation::Add, Some(_)) => {
                    return Err(Error::fault(
                        "InvalidArgument",
                        format!("group '{name}' already exists"),
                    ));
                }
                (_, None) => {
                    return Err(Error::fault(
                        "InvalidArgument",
                        format!("group '{name}' does not exist"),
                    ));
                }
            }
        }
        Ok(state.start_task(CLUSTER_RECONFIGURE_TASK, cluster, None))
    }

    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo> {
        let state = self.lock()?;
        state
            .tasks
            .iter()
            .find(|t| &t.info.task == task)
            .map(|t| t.info.clone())
            .ok_or_else(|| Error::managed_object_not_found(task.to_string()))
    }
}

#[async_trait]
impl RestClient for SimulatorSession {
    async fn session_is_active(&self) -> Result<bool> {
        Ok(self.state.lock().generation == self.generation)
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn get_tag(&self, id: &str) -> Result<Tag> {
        let state = self.rest("get_tag")?;
        state
            .tags
            .get(id)
            .cloned()
            .ok_or_else(|| Error::http(Some(404), format!("tag {id} not found")))
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self.rest("list_tags")?.tags.keys().cloned().collect())
    }

    async fn create_tag(&self, name: &str, category_id: &str) -> Result<String> {
        let mut state = self.rest("create_tag")?;
        if !state.categories.contains_key(category_id) {
            return Err(Error::http(Some(404), format!("category {category_id} not found")));
        }
        Ok(insert_tag(&mut state, name, category_id))
    }

    async fn delete_tag(&self, id: &str) -> Result<()> {
        let mut state = self.rest("delete_tag")?;
        state
            .tags
            .remove(id)
            .ok_or_else(|| Error::http(Some(404), format!("tag {id} not found")))?;
        state.attachments.retain(|(tag, _)| tag != id);
        Ok(())
    }

    async fn get_category(&self, id: &str) -> Result<Category> {
        let state = self.rest("get_category")?;
        state
            .categories
            .get(id)
            .cloned()
            .ok_or_else(|| Error::http(Some(404), format!("category {id} not found")))
    }

    async fn list_categories(&self) -> Result<Vec<String>> {
        Ok(self.rest("list_categories")?.categories.keys().cloned().collect())
    }

    async fn create_category(&self, name: &str, cardinality: &str) -> Result<String> {
        let mut state = self.rest("create_category")?;
        Ok(insert_category(&mut state, name, cardinality))
    }

    async fn delete_category(&self, id: &str) -> Result<()> {
        let mut state = self.rest("delete_category")?;
        state
            .categories
            .remove(id)
            .ok_or_else(|| Error::http(Some(404), format!("category {id} not found")))?;
        let orphaned: Vec<String> = state
            .tags
            .values()
            .filter(|t| t.category_id == id)
            .map(|t| t.id.clone())
            .collect();
        for tag in orphaned {
            state.tags.remove(&tag);
            state.attachments.retain(|(t, _)| t != &tag);
        }
        Ok(())
    }

    async fn list_attached_tags(&self, object: &MoRef) -> Result<Vec<String>> {
        let state = self.rest("list_attached_tags")?;
        Ok(state
            .attachments
            .iter()
            .filter(|(_, o)| o == object)
            .map(|(tag, _)| tag.clone())
            .collect())
    }

    async fn attach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        let mut state = self.rest("attach_tag")?;
        if !state.tags.contains_key(tag_id) {
            return Err(Error::http(Some(404), format!("tag {tag_id} not found")));
        }
        if state.reference(&object.value).is_none() {
            return Err(Error::http(Some(404), format!("object {object} not found")));
        }
        let attachment = (tag_id.to_string(), object.clone());
        if !state.attachments.contains(&attachment) {
            state.attachments.push(attachment);
        }
        Ok(())
    }

    async fn detach_tag(&self, tag_id: &str, object: &MoRef) -> Result<()> {
        let mut state = self.rest("detach_tag")?;
        state
            .attachments
            .retain(|(tag, o)| !(tag == tag_id && o == object));
        Ok(())
    }
}
