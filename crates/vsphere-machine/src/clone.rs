//! Clone of the template into the Machine's VM
//!
//! [`clone`] resolves placement, builds the device and guest configuration
//! changes and launches the clone task. It never waits for the task; the
//! caller records the returned task id in the provider status.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{info, warn};

use machine_api_common::crd::{DataDisk, ProvisioningMode};
use vsphere_client::{
    CloneSpec, Datacenter, DeviceChange, DiskMoveType, MoRef, OptionValue, RelocateSpec,
    ScsiController, VimClient, VirtualDevice, VirtualDisk, VirtualEthernetCard, VmConfigSpec,
    VmProperties,
};

use crate::error::{Error, Result};
use crate::ipam;
use crate::network::render_kargs;
use crate::scope::MachineScope;

/// Oldest template hardware version that can be cloned
pub const MIN_HARDWARE_VERSION: u32 = 15;

/// Highest unit number plus one on a SCSI controller
pub const MAX_UNIT_NUMBER: i32 = 30;

const MIN_CPUS: i32 = 2;
const MIN_MEMORY_MIB: i64 = 2048;
const FIRST_DATA_DISK_KEY: i32 = -100;
const NIC_ADAPTER: &str = "vmxnet3";
const USER_DATA_KEY: &str = "userData";

const IGNITION_DATA: &str = "guestinfo.ignition.config.data";
const IGNITION_ENCODING: &str = "guestinfo.ignition.config.data.encoding";
const HOSTNAME: &str = "guestinfo.hostname";
const STEAL_CLOCK: &str = "stealclock.enable";
const NETWORK_KARGS: &str = "guestinfo.afterburn.initrd.network-kargs";

/// Inventory objects a clone is placed into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementKind {
    /// VM folder
    Folder,
    /// Datastore
    Datastore,
    /// Resource pool
    ResourcePool,
    /// Network a NIC attaches to
    Network,
}

impl fmt::Display for PlacementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlacementKind::Folder => "folder",
            PlacementKind::Datastore => "datastore",
            PlacementKind::ResourcePool => "resource pool",
            PlacementKind::Network => "network",
        })
    }
}

/// Resolve a placement target, using the datacenter's single default when
/// `path` is unset
async fn resolve(
    vim: &dyn VimClient,
    dc: &Datacenter,
    machine: &str,
    kind: PlacementKind,
    path: Option<&str>,
) -> Result<MoRef> {
    let found = match kind {
        PlacementKind::Folder => vim.find_folder(dc, path).await,
        PlacementKind::Datastore => vim.find_datastore(dc, path).await,
        PlacementKind::ResourcePool => vim.find_resource_pool(dc, path).await,
        PlacementKind::Network => {
            return Err(Error::internal("networks are resolved per compute cluster"))
        }
    };
    found.map_err(|e| {
        if e.is_not_found() || e.is_multiple_found() {
            Error::invalid_configuration(
                machine,
                format!(
                    "unable to get {kind} for {}: {e}",
                    path.unwrap_or("default")
                ),
            )
        } else {
            e.into()
        }
    })
}

/// Launch the clone task and return its id
pub async fn clone(scope: &MachineScope) -> Result<String> {
    let machine = scope.name();
    let spec = &scope.provider_spec;
    let workspace = spec.workspace();
    let vim = scope.vim();
    let dc = scope.datacenter();

    let user_data = user_data(scope).await?;

    let template = vim
        .find_virtual_machine(dc, &spec.template)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                Error::invalid_configuration(&machine, format!("template {} not found", spec.template))
            } else if e.is_multiple_found() {
                Error::invalid_configuration(
                    &machine,
                    format!("multiple templates found, specify one: {}", spec.template),
                )
            } else {
                e.into()
            }
        })?;
    let template_properties = vim.vm_properties(&template).await?;
    check_hardware_version(&machine, &template_properties)?;

    let folder = resolve(vim, dc, &machine, PlacementKind::Folder, workspace.folder()).await?;
    let datastore =
        resolve(vim, dc, &machine, PlacementKind::Datastore, workspace.datastore()).await?;
    let pool = resolve(
        vim,
        dc,
        &machine,
        PlacementKind::ResourcePool,
        workspace.resource_pool(),
    )
    .await?;

    let disks = template_properties.disks();
    let [primary] = disks.as_slice() else {
        return Err(Error::invalid_configuration(
            &machine,
            format!(
                "invalid disk count: {}, template must have exactly one disk",
                disks.len()
            ),
        ));
    };

    let mut device_change = Vec::new();
    if spec.is_linked_clone() {
        if spec.disk_gib > 0 {
            warn!(
                machine = %machine,
                disk_gib = spec.disk_gib,
                "linked clone requested, ignoring disk size"
            );
        }
    } else if let Some(change) = resize_primary_disk(&machine, primary, spec.disk_gib)? {
        device_change.push(change);
    }

    if !spec.data_disks.is_empty() {
        let controller = template_properties
            .scsi_controller(primary.controller_key)
            .ok_or_else(|| {
                Error::internal(format!(
                    "controller {} of template disk not found",
                    primary.controller_key
                ))
            })?;
        device_change.extend(data_disk_changes(
            &machine,
            controller,
            &disks,
            &spec.data_disks,
        )?);
    }

    device_change.extend(nic_changes(scope, &template_properties, &pool).await?);

    let mut extra_config = Vec::new();
    if let Some(data) = user_data {
        extra_config.push(OptionValue::new(IGNITION_DATA, data));
        extra_config.push(OptionValue::new(IGNITION_ENCODING, "base64"));
    }
    extra_config.push(OptionValue::new(HOSTNAME, machine.as_str()));
    extra_config.push(OptionValue::new(STEAL_CLOCK, "TRUE"));
    if spec.has_static_ips() {
        let pooled = if spec.uses_ip_pools() {
            ipam::pool_addresses(scope).await?
        } else {
            Vec::new()
        };
        let kargs = render_kargs(&machine, &spec.network.devices, &pooled)?;
        extra_config.push(OptionValue::new(NETWORK_KARGS, kargs));
    }

    let num_cpus = spec.num_cpus.max(MIN_CPUS);
    let num_cores_per_socket = if spec.num_cores_per_socket == 0 {
        num_cpus
    } else {
        spec.num_cores_per_socket
    };

    let clone_spec = CloneSpec {
        location: RelocateSpec {
            datastore: Some(datastore),
            pool: Some(pool),
            disk_move_type: Some(if spec.is_linked_clone() {
                DiskMoveType::CreateNewChildDiskBacking
            } else {
                DiskMoveType::MoveAllDiskBackingsAndConsolidate
            }),
        },
        template: false,
        config: VmConfigSpec {
            num_cpus: Some(num_cpus),
            num_cores_per_socket: Some(num_cores_per_socket),
            memory_mb: Some(spec.memory_mib.max(MIN_MEMORY_MIB)),
            instance_uuid: Some(scope.uid()?),
            disk_uuid_enabled: Some(true),
            extra_config,
            device_change,
        },
        power_on: false,
        snapshot: snapshot(scope, &template_properties)?,
    };

    let task = vim
        .clone_vm(&template, &folder, &machine, &clone_spec)
        .await?;
    info!(
        machine = %machine,
        template = %spec.template,
        task = %task.value,
        linked = spec.is_linked_clone(),
        "cloning template"
    );
    Ok(task.value)
}

/// Guest ignition payload, base64 encoded exactly once
async fn user_data(scope: &MachineScope) -> Result<Option<String>> {
    let Some(reference) = scope.provider_spec.user_data_secret.as_ref() else {
        return Ok(None);
    };
    let secret = scope
        .kube
        .get_secret(&scope.namespace(), &reference.name)
        .await?
        .ok_or_else(|| Error::internal(format!("user data secret {} not found", reference.name)))?;
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(USER_DATA_KEY))
        .ok_or_else(|| {
            Error::invalid_configuration(
                &scope.name(),
                format!("secret {} has no {USER_DATA_KEY} key", reference.name),
            )
        })?;
    Ok(Some(encode_user_data(&data.0)))
}

/// Strip any number of base64 layers, then encode once
pub fn encode_user_data(raw: &[u8]) -> String {
    let mut current = raw.to_vec();
    while !current.is_empty() {
        match STANDARD.decode(&current) {
            Ok(decoded) => current = decoded,
            Err(_) => break,
        }
    }
    STANDARD.encode(current)
}

fn check_hardware_version(machine: &str, template: &VmProperties) -> Result<()> {
    let version = template
        .version
        .strip_prefix("vmx-")
        .and_then(|v| v.parse::<u32>().ok());
    match version {
        Some(v) if v >= MIN_HARDWARE_VERSION => Ok(()),
        _ => Err(Error::invalid_configuration(
            machine,
            format!(
                "hardware version {} of template {} is not supported, minimum is vmx-{MIN_HARDWARE_VERSION}",
                template.version, template.name
            ),
        )),
    }
}

/// Edit growing the primary disk to `disk_gib`; `None` keeps the template size
fn resize_primary_disk(
    machine: &str,
    primary: &VirtualDisk,
    disk_gib: i32,
) -> Result<Option<DeviceChange>> {
    if disk_gib <= 0 {
        return Ok(None);
    }
    let requested_kb = i64::from(disk_gib) * 1024 * 1024;
    if primary.capacity_in_kb > requested_kb {
        return Err(Error::invalid_configuration(
            machine,
            format!(
                "can't resize template disk down, initial capacity is larger: {}KiB > {}KiB",
                primary.capacity_in_kb, requested_kb
            ),
        ));
    }
    if primary.capacity_in_kb == requested_kb {
        return Ok(None);
    }
    let mut disk = primary.clone();
    disk.capacity_in_kb = requested_kb;
    Ok(Some(DeviceChange::edit(VirtualDevice::Disk(disk))))
}

/// Free unit numbers on `controller`, lowest first
fn free_units(controller: &ScsiController, used: &[i32], count: usize) -> Option<Vec<i32>> {
    let free: Vec<i32> = (0..MAX_UNIT_NUMBER)
        .filter(|u| *u != controller.scsi_ctlr_unit_number && !used.contains(u))
        .take(count)
        .collect();
    (free.len() == count).then_some(free)
}

fn data_disk_changes(
    machine: &str,
    controller: &ScsiController,
    existing: &[&VirtualDisk],
    data_disks: &[DataDisk],
) -> Result<Vec<DeviceChange>> {
    let used: Vec<i32> = existing
        .iter()
        .filter(|d| d.controller_key == controller.key)
        .filter_map(|d| d.unit_number)
        .collect();
    let units = free_units(controller, &used, data_disks.len()).ok_or_else(|| {
        Error::invalid_configuration(machine, "all unit numbers are already in-use")
    })?;

    Ok(data_disks
        .iter()
        .zip(units)
        .enumerate()
        .map(|(i, (data_disk, unit))| {
            let (thin, eager) = match data_disk.provisioning_mode {
                Some(ProvisioningMode::Thin) => (Some(true), None),
                Some(ProvisioningMode::Thick) => (Some(false), None),
                Some(ProvisioningMode::EagerlyZeroed) => (Some(false), Some(true)),
                None => (None, None),
            };
            DeviceChange::create(VirtualDevice::Disk(VirtualDisk {
                key: FIRST_DATA_DISK_KEY - i as i32,
                controller_key: controller.key,
                unit_number: Some(unit),
                capacity_in_kb: i64::from(data_disk.size_gib) * 1024 * 1024,
                file_name: String::new(),
                thin_provisioned: thin,
                eagerly_scrub: eager,
            }))
        })
        .collect())
}

/// Replace every template NIC with one vmxnet3 card per configured device
async fn nic_changes(
    scope: &MachineScope,
    template: &VmProperties,
    pool: &MoRef,
) -> Result<Vec<DeviceChange>> {
    let vim = scope.vim();
    let mut changes: Vec<DeviceChange> = template
        .ethernet_cards()
        .into_iter()
        .map(|card| DeviceChange::remove(VirtualDevice::Ethernet(card.clone())))
        .collect();

    let devices = &scope.provider_spec.network.devices;
    if devices.is_empty() {
        return Ok(changes);
    }

    let cluster = vim.resource_pool_owner(pool).await?;
    let networks = vim.cluster_networks(&cluster).await?;
    for (i, device) in devices.iter().enumerate() {
        let network = networks
            .iter()
            .find(|n| n.name == device.network_name)
            .ok_or_else(|| {
                Error::invalid_configuration(
                    &scope.name(),
                    format!(
                        "unable to get {} for {}",
                        PlacementKind::Network,
                        device.network_name
                    ),
                )
            })?;
        changes.push(DeviceChange::add(VirtualDevice::Ethernet(
            VirtualEthernetCard {
                key: i as i32,
                adapter: NIC_ADAPTER.to_string(),
                mac_address: None,
                backing: network.backing.clone(),
            },
        )));
    }
    Ok(changes)
}

/// Snapshot to clone from
///
/// A named snapshot must exist. Linked clones without a name use the
/// template's current snapshot.
fn snapshot(scope: &MachineScope, template: &VmProperties) -> Result<Option<MoRef>> {
    let spec = &scope.provider_spec;
    let snapshots = template.snapshot.as_ref();
    if !spec.snapshot.is_empty() {
        return snapshots
            .and_then(|s| s.find_by_name(&spec.snapshot))
            .map(|tree| Some(tree.snapshot.clone()))
            .ok_or_else(|| {
                Error::invalid_configuration(
                    &scope.name(),
                    format!("snapshot {} not found on template {}", spec.snapshot, template.name),
                )
            });
    }
    if !spec.is_linked_clone() {
        return Ok(None);
    }
    snapshots
        .and_then(|s| s.current_snapshot.clone())
        .map(Some)
        .ok_or_else(|| {
            Error::invalid_configuration(
                &scope.name(),
                format!(
                    "linked clone requires a snapshot, template {} has none",
                    template.name
                ),
            )
        })
}
