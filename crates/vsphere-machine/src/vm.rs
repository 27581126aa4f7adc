//! VM lookup and the operations the reconciler performs on a found VM

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use machine_api_common::crd::{InstanceState, MachineAddress};
use vsphere_client::{
    wait_for_task, CachingTagManager, DeviceChange, MoRef, PowerState, VimClient, VirtualDevice,
    VirtualDisk, VmConfigSpec, VmProperties,
};

use crate::cloud_config::RegionZoneLabels;
use crate::error::Result;
use crate::scope::MachineScope;

const RECONFIGURE_POLL: Duration = Duration::from_secs(1);
const RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of looking a Machine's VM up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmLookup {
    /// VM found
    Found(MoRef),
    /// Neither the instance UUID nor the name matched; carries the UUID
    NotFound(String),
}

/// Find the VM by instance UUID (the Machine UID), falling back to the name
pub async fn find_vm(scope: &MachineScope) -> Result<VmLookup> {
    let uid = scope.uid()?;
    let vim = scope.vim();
    if let Some(vm) = vim.find_by_instance_uuid(scope.datacenter(), &uid).await? {
        return Ok(VmLookup::Found(vm));
    }
    match vim
        .find_virtual_machine(scope.datacenter(), &scope.name())
        .await
    {
        Ok(vm) => {
            debug!(machine = %scope.name(), vm = %vm, "vm found by name");
            Ok(VmLookup::Found(vm))
        }
        Err(e) if e.is_not_found() => Ok(VmLookup::NotFound(uid)),
        Err(e) => Err(e.into()),
    }
}

/// Map a vCenter power state onto the provider status enum
pub fn instance_state(power_state: PowerState) -> InstanceState {
    match power_state {
        PowerState::PoweredOn => InstanceState::PoweredOn,
        PowerState::PoweredOff => InstanceState::PoweredOff,
        PowerState::Suspended => InstanceState::Suspended,
    }
}

/// Whether a disk file is one this Machine's clone created
///
/// Matches `<dir>/<machine>.vmdk` and `<dir>/<machine>_<n>.vmdk`.
pub fn is_os_disk(file_name: &str, machine: &str) -> bool {
    let base = file_name
        .rsplit('/')
        .next()
        .unwrap_or(file_name)
        .rsplit("] ")
        .next()
        .unwrap_or(file_name);
    let Some(stem) = base.strip_suffix(".vmdk") else {
        return false;
    };
    let Some(rest) = stem.strip_prefix(machine) else {
        return false;
    };
    match rest.strip_prefix('_') {
        None => rest.is_empty(),
        Some(index) => !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Region and zone tag names found for a VM
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionZone {
    /// Region tag name
    pub region: Option<String>,
    /// Zone tag name
    pub zone: Option<String>,
}

/// A found VM and a snapshot of its properties
pub struct VirtualMachine {
    vim: Arc<dyn VimClient>,
    /// VM reference
    pub reference: MoRef,
    /// Properties as of the last load
    pub properties: VmProperties,
}

impl VirtualMachine {
    /// Read the VM's properties
    pub async fn load(vim: Arc<dyn VimClient>, reference: MoRef) -> Result<Self> {
        let properties = vim.vm_properties(&reference).await?;
        Ok(Self {
            vim,
            reference,
            properties,
        })
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// BIOS UUID, recorded as the instance id and provider id
    pub fn uuid(&self) -> &str {
        &self.properties.uuid
    }

    /// Power state as recorded in the provider status
    pub fn instance_state(&self) -> InstanceState {
        instance_state(self.properties.power_state)
    }

    /// Whether the VM is running
    pub fn is_powered_on(&self) -> bool {
        self.properties.power_state == PowerState::PoweredOn
    }

    /// Start a power-on task and return its id
    pub async fn power_on(&self) -> Result<String> {
        let task = self.vim.power_on(&self.reference).await?;
        info!(vm = %self.name(), task = %task.value, "powering on vm");
        Ok(task.value)
    }

    /// Start a power-off task and return its id
    pub async fn power_off(&self) -> Result<String> {
        let task = self.vim.power_off(&self.reference).await?;
        info!(vm = %self.name(), task = %task.value, "powering off vm");
        Ok(task.value)
    }

    /// Start a destroy task and return its id
    pub async fn destroy(&self) -> Result<String> {
        let task = self.vim.destroy(&self.reference).await?;
        info!(vm = %self.name(), task = %task.value, "destroying vm");
        Ok(task.value)
    }

    /// Machine addresses: one internal IP per guest-reported address on a NIC
    /// the VM actually has, then the VM name as internal DNS
    pub fn addresses(&self) -> Vec<MachineAddress> {
        let macs: Vec<&str> = self
            .properties
            .ethernet_cards()
            .into_iter()
            .filter_map(|card| card.mac_address.as_deref())
            .collect();

        let mut addresses: Vec<MachineAddress> = self
            .properties
            .guest_nics
            .iter()
            .filter(|nic| {
                nic.mac_address
                    .as_deref()
                    .is_some_and(|mac| macs.iter().any(|m| m.eq_ignore_ascii_case(mac)))
            })
            .flat_map(|nic| nic.ip_addresses.iter().map(MachineAddress::internal_ip))
            .collect();
        addresses.push(MachineAddress::internal_dns(self.name()));
        addresses
    }

    /// Number of attached virtual disks
    pub fn disk_count(&self) -> usize {
        self.properties.disks().len()
    }

    /// Disks not created by this Machine's clone, e.g. persistent volumes
    pub fn foreign_disks(&self, machine: &str) -> Vec<VirtualDisk> {
        self.properties
            .disks()
            .into_iter()
            .filter(|d| !is_os_disk(&d.file_name, machine))
            .cloned()
            .collect()
    }

    /// Detach disks, keeping their backing files, and wait for the reconfigure
    pub async fn detach_disks(&self, disks: &[VirtualDisk]) -> Result<()> {
        if disks.is_empty() {
            return Ok(());
        }
        let spec = VmConfigSpec {
            device_change: disks
                .iter()
                .map(|d| DeviceChange::remove(VirtualDevice::Disk(d.clone())))
                .collect(),
            ..Default::default()
        };
        for disk in disks {
            info!(vm = %self.name(), disk = %disk.file_name, "detaching disk");
        }
        let task = self.vim.reconfigure_vm(&self.reference, &spec).await?;
        wait_for_task(
            self.vim.as_ref(),
            &task,
            RECONFIGURE_POLL,
            RECONFIGURE_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Attach the cluster tag, when it exists, and every configured tag
    ///
    /// Tags already attached are left alone.
    pub async fn reconcile_tags(
        &self,
        tags: &CachingTagManager,
        cluster_id: &str,
        tag_ids: &[String],
    ) -> Result<()> {
        let attached = tags.list_attached_tags(&self.reference).await?;

        match tags.get_tag(cluster_id).await {
            Ok(tag) if attached.contains(&tag.id) => {}
            Ok(tag) => {
                info!(vm = %self.name(), tag = %tag.name, "attaching cluster tag");
                tags.attach_tag(&tag.id, &self.reference).await?;
            }
            Err(e) if e.is_not_found() => {
                debug!(cluster_id, "cluster tag not found, skipping");
            }
            Err(e) => return Err(e.into()),
        }

        for id in tag_ids {
            let tag = tags.get_tag(id).await?;
            if attached.contains(&tag.id) {
                continue;
            }
            info!(vm = %self.name(), tag = %tag.name, "attaching tag");
            tags.attach_tag(&tag.id, &self.reference).await?;
        }
        Ok(())
    }

    /// Region and zone from tags on the VM's host and its ancestors
    ///
    /// The nearest ancestor carrying a tag of the configured category wins.
    pub async fn region_zone(
        &self,
        tags: &CachingTagManager,
        labels: &RegionZoneLabels,
    ) -> Result<RegionZone> {
        let mut found = RegionZone::default();
        if labels.is_empty() {
            return Ok(found);
        }

        let mut current = self.properties.host.clone();
        while let Some(object) = current {
            for tag in tags.attached_tags(&object).await? {
                let category = match tags.get_category(&tag.category_id).await {
                    Ok(category) => category,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                let name = Some(category.name.as_str());
                if found.region.is_none() && labels.region.as_deref() == name {
                    found.region = Some(tag.name.clone());
                }
                if found.zone.is_none() && labels.zone.as_deref() == name {
                    found.zone = Some(tag.name.clone());
                }
            }
            let done = (labels.region.is_none() || found.region.is_some())
                && (labels.zone.is_none() || found.zone.is_some());
            if done {
                break;
            }
            current = self.vim.managed_entity(&object).await?.parent;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, MACHINE_UID};
    use machine_api_common::crd::AddressType;
    use vsphere_client::simulator::Simulator;
    use vsphere_client::GuestNicInfo;

    async fn load(sim: &Simulator, vm: &MoRef) -> VirtualMachine {
        VirtualMachine::load(Arc::new(sim.session()), vm.clone())
            .await
            .unwrap()
    }

    // =========================================================================
    // Lookup Tests
    // =========================================================================

    #[tokio::test]
    async fn finds_vm_by_instance_uuid() {
        let h = Harness::new();
        let vm = h.sim.create_vm("renamed", MACHINE_UID, PowerState::PoweredOn);
        let scope = h.scope(&h.store(h.machine())).await.unwrap();

        assert_eq!(find_vm(&scope).await.unwrap(), VmLookup::Found(vm));
    }

    #[tokio::test]
    async fn falls_back_to_name() {
        let h = Harness::new();
        let vm = h.sim.create_vm("worker-0", "other-uuid", PowerState::PoweredOn);
        let scope = h.scope(&h.store(h.machine())).await.unwrap();

        assert_eq!(find_vm(&scope).await.unwrap(), VmLookup::Found(vm));
    }

    #[tokio::test]
    async fn not_found_carries_uuid() {
        let h = Harness::new();
        let scope = h.scope(&h.store(h.machine())).await.unwrap();

        assert_eq!(
            find_vm(&scope).await.unwrap(),
            VmLookup::NotFound(MACHINE_UID.to_string())
        );
    }

    // =========================================================================
    // Address Tests
    // =========================================================================

    #[tokio::test]
    async fn addresses_follow_nics_with_known_macs_then_dns() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let mac = sim.vm(&vm).unwrap().ethernet_cards()[0]
            .mac_address
            .clone()
            .unwrap();
        sim.set_guest_nics(
            &vm,
            vec![
                GuestNicInfo {
                    mac_address: Some(mac),
                    ip_addresses: vec!["10.0.0.5".to_string(), "fe80::1".to_string()],
                    network: Some("VM Network".to_string()),
                    connected: true,
                },
                GuestNicInfo {
                    mac_address: Some("02:42:ac:11:00:02".to_string()),
                    ip_addresses: vec!["172.17.0.2".to_string()],
                    network: None,
                    connected: true,
                },
            ],
        );

        let addresses = load(&sim, &vm).await.addresses();
        let rendered: Vec<(AddressType, &str)> = addresses
            .iter()
            .map(|a| (a.type_, a.address.as_str()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                (AddressType::InternalIp, "10.0.0.5"),
                (AddressType::InternalIp, "fe80::1"),
                (AddressType::InternalDns, "worker-0"),
            ]
        );
    }

    #[tokio::test]
    async fn vm_without_guest_info_has_only_dns() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOff);
        let addresses = load(&sim, &vm).await.addresses();
        assert_eq!(addresses, vec![MachineAddress::internal_dns("worker-0")]);
    }

    // =========================================================================
    // Disk Tests
    // =========================================================================

    #[test]
    fn os_disk_pattern() {
        assert!(is_os_disk("[LocalDS_0] worker-0/worker-0.vmdk", "worker-0"));
        assert!(is_os_disk("[LocalDS_0] worker-0/worker-0_1.vmdk", "worker-0"));
        assert!(is_os_disk("[LocalDS_0] worker-0.vmdk", "worker-0"));
        assert!(!is_os_disk("[LocalDS_0] worker-0/worker-0_.vmdk", "worker-0"));
        assert!(!is_os_disk("[LocalDS_0] worker-0/worker-0_a.vmdk", "worker-0"));
        assert!(!is_os_disk("[LocalDS_0] worker-0/worker-01.vmdk", "worker-0"));
        assert!(!is_os_disk("[LocalDS_0] kubevols/pvc-1234.vmdk", "worker-0"));
        assert!(!is_os_disk("[LocalDS_0] worker-0/worker-0.vmx", "worker-0"));
    }

    #[tokio::test]
    async fn foreign_disks_are_detached() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        sim.attach_disk(&vm, "[LocalDS_0] kubevols/pvc-1.vmdk", 1024);
        sim.attach_disk(&vm, "[LocalDS_0] kubevols/pvc-2.vmdk", 1024);

        let machine_vm = load(&sim, &vm).await;
        assert_eq!(machine_vm.disk_count(), 3);
        let foreign = machine_vm.foreign_disks("worker-0");
        assert_eq!(foreign.len(), 2);

        machine_vm.detach_disks(&foreign).await.unwrap();

        assert_eq!(sim.vm(&vm).unwrap().disks().len(), 1);
        let (_, spec) = sim.reconfigure_requests().pop().unwrap();
        assert_eq!(spec.device_change.len(), 2);
        assert!(spec.device_change.iter().all(|c| c.file_operation.is_none()));
    }

    // =========================================================================
    // Tag Tests
    // =========================================================================

    #[tokio::test]
    async fn tags_are_attached_once() {
        let sim = Simulator::new();
        let session = sim.session();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let category = sim.create_category("openshift-cluster-abc");
        let cluster_tag = sim.create_tag("cluster-abc", &category);
        let extra = sim.create_tag("team-a", &category);
        let tags = CachingTagManager::new(Arc::new(session));

        let machine_vm = load(&sim, &vm).await;
        machine_vm
            .reconcile_tags(&tags, "cluster-abc", &[extra.clone()])
            .await
            .unwrap();
        assert_eq!(sim.rest_calls("attach_tag"), 2);

        machine_vm
            .reconcile_tags(&tags, "cluster-abc", &[extra.clone()])
            .await
            .unwrap();
        assert_eq!(sim.rest_calls("attach_tag"), 2);

        let attached = tags.list_attached_tags(&vm).await.unwrap();
        assert!(attached.contains(&cluster_tag));
        assert!(attached.contains(&extra));
    }

    #[tokio::test]
    async fn missing_cluster_tag_is_skipped() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let tags = CachingTagManager::new(Arc::new(sim.session()));

        load(&sim, &vm)
            .await
            .reconcile_tags(&tags, "cluster-abc", &[])
            .await
            .unwrap();
        assert_eq!(sim.rest_calls("attach_tag"), 0);
    }

    #[tokio::test]
    async fn missing_configured_tag_is_an_error() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let tags = CachingTagManager::new(Arc::new(sim.session()));

        let err = load(&sim, &vm)
            .await
            .reconcile_tags(&tags, "cluster-abc", &["urn:vmomi:missing".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("urn:vmomi:missing"));
    }

    // =========================================================================
    // Region/Zone Tests
    // =========================================================================

    fn labels() -> RegionZoneLabels {
        RegionZoneLabels {
            region: Some("region".to_string()),
            zone: Some("zone".to_string()),
        }
    }

    #[tokio::test]
    async fn region_and_zone_from_host_ancestry() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let region = sim.create_category("region");
        let zone = sim.create_category("zone");
        let test_region = sim.create_tag("testRegion", &region);
        let test_zone = sim.create_tag("testZone", &zone);
        sim.attach_tag(&test_region, &sim.cluster());
        sim.attach_tag(&test_zone, &sim.host_folder());
        let tags = CachingTagManager::new(Arc::new(sim.session()));

        let found = load(&sim, &vm)
            .await
            .region_zone(&tags, &labels())
            .await
            .unwrap();
        assert_eq!(found.region.as_deref(), Some("testRegion"));
        assert_eq!(found.zone.as_deref(), Some("testZone"));
    }

    #[tokio::test]
    async fn nearest_ancestor_wins() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let zone = sim.create_category("zone");
        let near = sim.create_tag("zone-near", &zone);
        let far = sim.create_tag("zone-far", &zone);
        sim.attach_tag(&near, &sim.host());
        sim.attach_tag(&far, &sim.datacenter());
        let tags = CachingTagManager::new(Arc::new(sim.session()));

        let found = load(&sim, &vm)
            .await
            .region_zone(&tags, &labels())
            .await
            .unwrap();
        assert_eq!(found.zone.as_deref(), Some("zone-near"));
        assert!(found.region.is_none());
    }

    #[tokio::test]
    async fn unconfigured_labels_skip_tag_lookups() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOn);
        let tags = CachingTagManager::new(Arc::new(sim.session()));

        let found = load(&sim, &vm)
            .await
            .region_zone(&tags, &RegionZoneLabels::default())
            .await
            .unwrap();
        assert_eq!(found, RegionZone::default());
        assert_eq!(sim.rest_calls("list_attached_tags"), 0);
    }
}
