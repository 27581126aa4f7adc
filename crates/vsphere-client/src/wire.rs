//! VI/JSON encoding of the inventory model
//!
//! Every data object on the wire carries a `_typeName` discriminator. Encoders
//! emit exactly the fields the server needs; decoders read only the fields the
//! actuator uses and ignore the rest.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::types::{
    ArrayOperation, CloneSpec, ClusterConfigInfo, ClusterConfigSpec, ClusterGroup,
    ClusterHostGroup, ClusterVmGroup, DeviceChange, DeviceOperation, DiskMoveType, FileOperation,
    GuestNicInfo, LocalizedMethodFault, MoRef, NetworkBacking, RelocateSpec, ScsiController,
    SnapshotInfo, SnapshotTree, TaskInfo, TaskState, VirtualDevice, VirtualDisk,
    VirtualEthernetCard, VmConfigSpec,
};

const TYPE_NAME: &str = "_typeName";

const SCSI_CONTROLLER_TYPES: &[&str] = &[
    "ParaVirtualSCSIController",
    "VirtualLsiLogicController",
    "VirtualLsiLogicSASController",
    "VirtualBusLogicController",
];

const ETHERNET_TYPES: &[&str] = &[
    "VirtualVmxnet3",
    "VirtualVmxnet2",
    "VirtualE1000",
    "VirtualE1000e",
    "VirtualPCNet32",
];

fn type_name(value: &Value) -> Option<&str> {
    value.get(TYPE_NAME).and_then(Value::as_str)
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn i32_field(value: &Value, field: &str) -> Option<i32> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
}

fn array_field<'a>(value: &'a Value, field: &str) -> &'a [Value] {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

// =============================================================================
// References
// =============================================================================

/// Encode a managed object reference
pub fn encode_moref(reference: &MoRef) -> Value {
    json!({
        TYPE_NAME: "ManagedObjectReference",
        "type": reference.type_,
        "value": reference.value,
    })
}

/// Decode a managed object reference
pub fn decode_moref(value: &Value) -> Result<MoRef> {
    match (str_field(value, "type"), str_field(value, "value")) {
        (Some(type_), Some(v)) => Ok(MoRef::new(type_, v)),
        _ => Err(Error::decode(format!(
            "expected ManagedObjectReference, got {value}"
        ))),
    }
}

/// Decode an optional reference, treating `null` as absent
pub fn decode_optional_moref(value: Option<&Value>) -> Result<Option<MoRef>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => decode_moref(v).map(Some),
    }
}

/// Decode an array of references
pub fn decode_moref_list(value: &Value) -> Result<Vec<MoRef>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(decode_moref).collect(),
        other => Err(Error::decode(format!("expected reference list, got {other}"))),
    }
}

// =============================================================================
// Devices
// =============================================================================

fn encode_backing(backing: &NetworkBacking) -> Value {
    match backing {
        NetworkBacking::Network {
            device_name,
            network,
        } => json!({
            TYPE_NAME: "VirtualEthernetCardNetworkBackingInfo",
            "deviceName": device_name,
            "network": encode_moref(network),
        }),
        NetworkBacking::DistributedPortgroup {
            switch_uuid,
            portgroup_key,
        } => json!({
            TYPE_NAME: "VirtualEthernetCardDistributedVirtualPortBackingInfo",
            "port": {
                TYPE_NAME: "DistributedVirtualSwitchPortConnection",
                "switchUuid": switch_uuid,
                "portgroupKey": portgroup_key,
            },
        }),
    }
}

fn decode_backing(value: &Value) -> Result<NetworkBacking> {
    match type_name(value) {
        Some("VirtualEthernetCardNetworkBackingInfo") => Ok(NetworkBacking::Network {
            device_name: str_field(value, "deviceName").unwrap_or_default(),
            network: value
                .get("network")
                .map(decode_moref)
                .transpose()?
                .ok_or_else(|| Error::decode("network backing without network"))?,
        }),
        Some("VirtualEthernetCardDistributedVirtualPortBackingInfo") => {
            let port = value.get("port").cloned().unwrap_or(Value::Null);
            Ok(NetworkBacking::DistributedPortgroup {
                switch_uuid: str_field(&port, "switchUuid").unwrap_or_default(),
                portgroup_key: str_field(&port, "portgroupKey").unwrap_or_default(),
            })
        }
        other => Err(Error::decode(format!(
            "unsupported ethernet backing {}",
            other.unwrap_or("<untyped>")
        ))),
    }
}

/// Encode a device
pub fn encode_device(device: &VirtualDevice) -> Value {
    match device {
        VirtualDevice::Disk(disk) => {
            let mut backing = Map::new();
            backing.insert(TYPE_NAME.into(), "VirtualDiskFlatVer2BackingInfo".into());
            backing.insert("fileName".into(), disk.file_name.clone().into());
            backing.insert("diskMode".into(), "persistent".into());
            if let Some(thin) = disk.thin_provisioned {
                backing.insert("thinProvisioned".into(), thin.into());
            }
            if let Some(scrub) = disk.eagerly_scrub {
                backing.insert("eagerlyScrub".into(), scrub.into());
            }
            let mut out = json!({
                TYPE_NAME: "VirtualDisk",
                "key": disk.key,
                "controllerKey": disk.controller_key,
                "capacityInKB": disk.capacity_in_kb,
                "backing": Value::Object(backing),
            });
            if let Some(unit) = disk.unit_number {
                out["unitNumber"] = unit.into();
            }
            out
        }
        VirtualDevice::Ethernet(card) => {
            let type_name = match card.adapter.as_str() {
                "vmxnet3" => "VirtualVmxnet3",
                "e1000" => "VirtualE1000",
                "e1000e" => "VirtualE1000e",
                other => other,
            };
            let mut out = json!({
                TYPE_NAME: type_name,
                "key": card.key,
                "backing": encode_backing(&card.backing),
                "addressType": "generated",
            });
            if let Some(mac) = &card.mac_address {
                out["macAddress"] = mac.clone().into();
            }
            out
        }
        VirtualDevice::ScsiController(ctrl) => json!({
            TYPE_NAME: "ParaVirtualSCSIController",
            "key": ctrl.key,
            "busNumber": ctrl.bus_number,
            "scsiCtlrUnitNumber": ctrl.scsi_ctlr_unit_number,
            "sharedBus": "noSharing",
        }),
        VirtualDevice::Other { key, type_name } => json!({
            TYPE_NAME: type_name,
            "key": key,
        }),
    }
}

/// Decode a device
pub fn decode_device(value: &Value) -> Result<VirtualDevice> {
    let key = i32_field(value, "key").ok_or_else(|| Error::decode("device without key"))?;
    let type_ = type_name(value).unwrap_or("VirtualDevice");

    if type_ == "VirtualDisk" {
        let backing = value.get("backing").cloned().unwrap_or(Value::Null);
        return Ok(VirtualDevice::Disk(VirtualDisk {
            key,
            controller_key: i32_field(value, "controllerKey").unwrap_or_default(),
            unit_number: i32_field(value, "unitNumber"),
            capacity_in_kb: value
                .get("capacityInKB")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            file_name: str_field(&backing, "fileName").unwrap_or_default(),
            thin_provisioned: backing.get("thinProvisioned").and_then(Value::as_bool),
            eagerly_scrub: backing.get("eagerlyScrub").and_then(Value::as_bool),
        }));
    }

    if ETHERNET_TYPES.contains(&type_) {
        let adapter = match type_ {
            "VirtualVmxnet3" => "vmxnet3",
            "VirtualE1000" => "e1000",
            "VirtualE1000e" => "e1000e",
            other => other,
        };
        let backing = value
            .get("backing")
            .ok_or_else(|| Error::decode("ethernet card without backing"))?;
        return Ok(VirtualDevice::Ethernet(VirtualEthernetCard {
            key,
            adapter: adapter.to_string(),
            mac_address: str_field(value, "macAddress"),
            backing: decode_backing(backing)?,
        }));
    }

    if SCSI_CONTROLLER_TYPES.contains(&type_) {
        return Ok(VirtualDevice::ScsiController(ScsiController {
            key,
            bus_number: i32_field(value, "busNumber").unwrap_or_default(),
            scsi_ctlr_unit_number: i32_field(value, "scsiCtlrUnitNumber").unwrap_or(7),
        }));
    }

    Ok(VirtualDevice::Other {
        key,
        type_name: type_.to_string(),
    })
}

fn encode_device_change(change: &DeviceChange) -> Value {
    let operation = match change.operation {
        DeviceOperation::Add => "add",
        DeviceOperation::Edit => "edit",
        DeviceOperation::Remove => "remove",
    };
    let mut out = json!({
        TYPE_NAME: "VirtualDeviceConfigSpec",
        "operation": operation,
        "device": encode_device(&change.device),
    });
    if let Some(op) = change.file_operation {
        out["fileOperation"] = match op {
            FileOperation::Create => "create",
            FileOperation::Destroy => "destroy",
        }
        .into();
    }
    out
}

// =============================================================================
// Specs
// =============================================================================

/// Encode a VM config spec
pub fn encode_config_spec(spec: &VmConfigSpec) -> Value {
    let mut out = Map::new();
    out.insert(TYPE_NAME.into(), "VirtualMachineConfigSpec".into());
    if let Some(cpus) = spec.num_cpus {
        out.insert("numCPUs".into(), cpus.into());
    }
    if let Some(cores) = spec.num_cores_per_socket {
        out.insert("numCoresPerSocket".into(), cores.into());
    }
    if let Some(memory) = spec.memory_mb {
        out.insert("memoryMB".into(), memory.into());
    }
    if let Some(uuid) = &spec.instance_uuid {
        out.insert("instanceUuid".into(), uuid.clone().into());
    }
    if let Some(enabled) = spec.disk_uuid_enabled {
        out.insert(
            "flags".into(),
            json!({ TYPE_NAME: "VirtualMachineFlagInfo", "diskUuidEnabled": enabled }),
        );
    }
    if !spec.extra_config.is_empty() {
        let options: Vec<Value> = spec
            .extra_config
            .iter()
            .map(|o| {
                json!({
                    TYPE_NAME: "OptionValue",
                    "key": o.key,
                    "value": { TYPE_NAME: "string", "_value": o.value },
                })
            })
            .collect();
        out.insert("extraConfig".into(), options.into());
    }
    if !spec.device_change.is_empty() {
        let changes: Vec<Value> = spec.device_change.iter().map(encode_device_change).collect();
        out.insert("deviceChange".into(), changes.into());
    }
    Value::Object(out)
}

fn encode_relocate_spec(spec: &RelocateSpec) -> Value {
    let mut out = Map::new();
    out.insert(TYPE_NAME.into(), "VirtualMachineRelocateSpec".into());
    if let Some(ds) = &spec.datastore {
        out.insert("datastore".into(), encode_moref(ds));
    }
    if let Some(pool) = &spec.pool {
        out.insert("pool".into(), encode_moref(pool));
    }
    if let Some(kind) = spec.disk_move_type {
        let kind = match kind {
            DiskMoveType::MoveAllDiskBackingsAndConsolidate => {
                "moveAllDiskBackingsAndConsolidate"
            }
            DiskMoveType::CreateNewChildDiskBacking => "createNewChildDiskBacking",
        };
        out.insert("diskMoveType".into(), kind.into());
    }
    Value::Object(out)
}

/// Encode a clone spec
pub fn encode_clone_spec(spec: &CloneSpec) -> Value {
    let mut out = json!({
        TYPE_NAME: "VirtualMachineCloneSpec",
        "location": encode_relocate_spec(&spec.location),
        "template": spec.template,
        "config": encode_config_spec(&spec.config),
        "powerOn": spec.power_on,
    });
    if let Some(snapshot) = &spec.snapshot {
        out["snapshot"] = encode_moref(snapshot);
    }
    out
}

/// Encode a cluster reconfiguration
pub fn encode_cluster_config_spec(spec: &ClusterConfigSpec) -> Value {
    let groups: Vec<Value> = spec
        .group_spec
        .iter()
        .map(|g| {
            let operation = match g.operation {
                ArrayOperation::Add => "add",
                ArrayOperation::Edit => "edit",
                ArrayOperation::Remove => "remove",
            };
            let mut out = json!({
                TYPE_NAME: "ClusterGroupSpec",
                "operation": operation,
                "info": {
                    TYPE_NAME: "ClusterVmGroup",
                    "name": g.info.name,
                    "vm": g.info.vm.iter().map(encode_moref).collect::<Vec<_>>(),
                },
            });
            if g.operation == ArrayOperation::Remove {
                out["removeKey"] = g.info.name.clone().into();
            }
            out
        })
        .collect();
    json!({
        TYPE_NAME: "ClusterConfigSpecEx",
        "groupSpec": groups,
    })
}

// =============================================================================
// Results
// =============================================================================

/// Decode the `configurationEx` property of a cluster
pub fn decode_cluster_config(value: &Value) -> Result<ClusterConfigInfo> {
    let mut groups = Vec::new();
    for group in array_field(value, "group") {
        let name = str_field(group, "name").unwrap_or_default();
        match type_name(group) {
            Some("ClusterVmGroup") => groups.push(ClusterGroup::Vm(ClusterVmGroup {
                name,
                vm: decode_moref_list(group.get("vm").unwrap_or(&Value::Null))?,
            })),
            Some("ClusterHostGroup") => groups.push(ClusterGroup::Host(ClusterHostGroup {
                name,
                host: decode_moref_list(group.get("host").unwrap_or(&Value::Null))?,
            })),
            _ => {}
        }
    }
    Ok(ClusterConfigInfo { groups })
}

/// Decode a `TaskInfo`
pub fn decode_task_info(value: &Value) -> Result<TaskInfo> {
    let task = value
        .get("task")
        .map(decode_moref)
        .transpose()?
        .ok_or_else(|| Error::decode("task info without task reference"))?;
    let state: TaskState = value
        .get("state")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or(TaskState::Unknown);
    let error = match value.get("error") {
        None | Some(Value::Null) => None,
        Some(err) => Some(LocalizedMethodFault {
            fault: err.get("fault").and_then(type_name).map(str::to_string),
            localized_message: str_field(err, "localizedMessage").unwrap_or_default(),
        }),
    };
    Ok(TaskInfo {
        task,
        description_id: str_field(value, "descriptionId").unwrap_or_default(),
        entity: decode_optional_moref(value.get("entity"))?,
        state,
        error,
        result: match value.get("result") {
            Some(r) if type_name(r) == Some("ManagedObjectReference") => Some(decode_moref(r)?),
            _ => None,
        },
    })
}

fn decode_snapshot_tree(value: &Value) -> Result<SnapshotTree> {
    Ok(SnapshotTree {
        name: str_field(value, "name").unwrap_or_default(),
        snapshot: value
            .get("snapshot")
            .map(decode_moref)
            .transpose()?
            .ok_or_else(|| Error::decode("snapshot tree without snapshot"))?,
        children: array_field(value, "childSnapshotList")
            .iter()
            .map(decode_snapshot_tree)
            .collect::<Result<_>>()?,
    })
}

/// Decode the `snapshot` property of a VM
pub fn decode_snapshot_info(value: &Value) -> Result<Option<SnapshotInfo>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(SnapshotInfo {
        current_snapshot: decode_optional_moref(value.get("currentSnapshot"))?,
        root_snapshot_list: array_field(value, "rootSnapshotList")
            .iter()
            .map(decode_snapshot_tree)
            .collect::<Result<_>>()?,
    }))
}

/// Decode the `net` array of a VM's guest info
pub fn decode_guest_nics(guest: &Value) -> Vec<GuestNicInfo> {
    array_field(guest, "net")
        .iter()
        .map(|nic| GuestNicInfo {
            mac_address: str_field(nic, "macAddress"),
            ip_addresses: array_field(nic, "ipAddress")
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            network: str_field(nic, "network"),
            connected: nic
                .get("connected")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

/// Decode a fault body into an error
pub fn decode_fault(status: u16, body: &Value) -> Error {
    let fault = type_name(body).unwrap_or("SystemError").to_string();
    let message = str_field(body, "message")
        .or_else(|| {
            array_field(body, "faultMessage")
                .first()
                .and_then(|m| str_field(m, "message"))
        })
        .unwrap_or_else(|| format!("server returned {status}"));

    match fault.as_str() {
        "ManagedObjectNotFound" => {
            let reference = body
                .get("obj")
                .and_then(|o| decode_moref(o).ok())
                .map(|r| r.to_string())
                .unwrap_or_default();
            Error::managed_object_not_found(reference)
        }
        "NotAuthenticated" | "InvalidLogin" => Error::not_authenticated(message),
        _ => Error::fault(fault, message),
    }
}
