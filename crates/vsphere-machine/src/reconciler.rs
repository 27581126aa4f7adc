//! Machine lifecycle against vCenter
//!
//! Each verb launches at most one long-running vCenter task and returns.
//! The task id is persisted in `providerStatus.taskRef` and picked up again
//! by the next reconcile, so every verb can be re-entered at any point.

use tracing::{debug, info, instrument, warn};

use machine_api_common::crd::{
    condition_types, phases, reasons, ConditionStatus, InstanceState, ProviderCondition,
};
use machine_api_common::{
    Feature, EXCLUDE_NODE_DRAINING_ANNOTATION, INSTANCE_STATE_ANNOTATION,
    MACHINE_CLUSTER_ID_LABEL, MACHINE_REGION_LABEL, MACHINE_ZONE_LABEL,
};
use vsphere_client::PowerState;

use crate::clone;
use crate::cloud_config;
use crate::drain;
use crate::error::{Error, Result};
use crate::ipam;
use crate::scope::MachineScope;
use crate::status::set_condition;
use crate::task::{check_task, TaskOutcome};
use crate::vm::{find_vm, VirtualMachine, VmLookup};
use crate::vm_group::{self, Membership};

/// Create the VM, or advance a creation already in progress
///
/// Every error, including waiting on a task or on IP address claims, marks
/// `MachineCreation` false with the error message.
#[instrument(skip_all, fields(machine = %scope.name()))]
pub async fn create(scope: &mut MachineScope) -> Result<()> {
    let result = create_steps(scope).await;
    match &result {
        Ok(()) => set_condition(
            &mut scope.provider_status,
            ProviderCondition::new(
                condition_types::MACHINE_CREATION,
                ConditionStatus::True,
                reasons::MACHINE_CREATION_SUCCEEDED,
                "",
            ),
        ),
        Err(e) => set_condition(
            &mut scope.provider_status,
            ProviderCondition::new(
                condition_types::MACHINE_CREATION,
                ConditionStatus::False,
                reasons::MACHINE_CREATION_FAILED,
                e.to_string(),
            ),
        ),
    }
    result
}

async fn create_steps(scope: &mut MachineScope) -> Result<()> {
    validate(scope)?;

    if scope.provider_spec.uses_ip_pools() {
        claim_addresses(scope).await?;
    }

    if !scope.provider_status.task_ref.is_empty() {
        let task_ref = scope.provider_status.task_ref.clone();
        let outcome = check_task(scope.vim(), &task_ref).await?;
        match &outcome {
            TaskOutcome::Unfinished { description_id } => {
                return Err(Error::requeue(format!(
                    "{description_id} task {task_ref} has not finished"
                )));
            }
            TaskOutcome::ServerForgot => {
                debug!(task = %task_ref, "previous task is gone, continuing");
                scope.provider_status.task_ref.clear();
            }
            TaskOutcome::Failed {
                description_id,
                message,
            } => {
                scope.provider_status.task_ref.clear();
                if outcome.is_clone() {
                    return Err(Error::create_machine(&scope.name(), message.clone()));
                }
                return Err(Error::internal(format!(
                    "{description_id} task {task_ref} failed: {message}"
                )));
            }
            TaskOutcome::Succeeded { description_id } => {
                debug!(task = %task_ref, description_id = %description_id, "previous task finished");
                scope.provider_status.task_ref.clear();
                if outcome.is_clone() {
                    return after_clone(scope).await;
                }
            }
        }
    }

    if let VmLookup::Found(reference) = find_vm(scope).await? {
        let vm = VirtualMachine::load(scope.session.vim.clone(), reference).await?;
        record_vm(scope, &vm);
        if vm.properties.power_state == PowerState::PoweredOn {
            debug!(vm = %vm.name(), "vm already exists and is powered on");
            return Ok(());
        }
        if scope.provider_status.instance_state == Some(InstanceState::PoweredOff) {
            info!(vm = %vm.name(), "resuming creation of powered-off vm");
        }
        return join_group_and_power_on(scope, &vm).await;
    }

    scope.provider_status.task_ref = clone::clone(scope).await?;
    Ok(())
}

fn validate(scope: &MachineScope) -> Result<()> {
    let name = scope.name();
    if scope
        .machine
        .label(MACHINE_CLUSTER_ID_LABEL)
        .filter(|id| !id.is_empty())
        .is_none()
    {
        return Err(Error::invalid_configuration(
            &name,
            format!("{MACHINE_CLUSTER_ID_LABEL} label not set"),
        ));
    }

    let spec = &scope.provider_spec;
    let gates = &scope.feature_gates;
    if spec.workspace().vm_group().is_some() && !gates.enabled(Feature::VSphereHostVMGroupZonal) {
        return Err(Error::invalid_configuration(
            &name,
            format!(
                "workspace.vmGroup requires the {} feature gate",
                Feature::VSphereHostVMGroupZonal.name()
            ),
        ));
    }
    if spec.has_static_ips() && !gates.enabled(Feature::VSphereStaticIPs) {
        return Err(Error::invalid_configuration(
            &name,
            format!(
                "static IP configuration requires the {} feature gate",
                Feature::VSphereStaticIPs.name()
            ),
        ));
    }
    if !spec.data_disks.is_empty() && !gates.enabled(Feature::VSphereMultiDisk) {
        return Err(Error::invalid_configuration(
            &name,
            format!(
                "dataDisks requires the {} feature gate",
                Feature::VSphereMultiDisk.name()
            ),
        ));
    }
    Ok(())
}

async fn claim_addresses(scope: &mut MachineScope) -> Result<()> {
    let outstanding = ipam::ensure_claims(scope).await?;
    if outstanding > 0 {
        set_condition(
            &mut scope.provider_status,
            ProviderCondition::new(
                condition_types::IP_ADDRESS_CLAIMED,
                ConditionStatus::False,
                reasons::WAITING_FOR_IP_ADDRESS,
                format!("waiting for {outstanding} IP address claims to be bound"),
            ),
        );
        return Err(Error::requeue("waiting for IP address claims to be bound"));
    }
    set_condition(
        &mut scope.provider_status,
        ProviderCondition::new(
            condition_types::IP_ADDRESS_CLAIMED,
            ConditionStatus::True,
            reasons::IP_ADDRESSES_CLAIMED,
            "",
        ),
    );
    Ok(())
}

/// Join the VM group, if any, and power the fresh clone on
async fn after_clone(scope: &mut MachineScope) -> Result<()> {
    let reference = match find_vm(scope).await? {
        VmLookup::Found(reference) => reference,
        VmLookup::NotFound(uuid) => {
            return Err(Error::internal(format!(
                "clone finished but vm with instance uuid {uuid} was not found"
            )))
        }
    };
    let vm = VirtualMachine::load(scope.session.vim.clone(), reference).await?;
    record_vm(scope, &vm);
    join_group_and_power_on(scope, &vm).await
}

/// VM group membership always precedes power-on, whichever path reaches it
async fn join_group_and_power_on(scope: &mut MachineScope, vm: &VirtualMachine) -> Result<()> {
    if let Some(group) = scope.provider_spec.workspace().vm_group() {
        vm_group::update_membership(
            scope.vim(),
            &scope.name(),
            &vm.reference,
            group,
            Membership::Add,
        )
        .await?;
    }

    scope.provider_status.task_ref = vm.power_on().await?;
    Ok(())
}

/// Whether the VM exists for the purpose of choosing between create and update
///
/// A VM that is not powered on while the Machine is still provisioning does
/// not count: its power state is persisted and creation resumes at power-on.
#[instrument(skip_all, fields(machine = %scope.name()))]
pub async fn exists(scope: &mut MachineScope) -> Result<bool> {
    let VmLookup::Found(reference) = find_vm(scope).await? else {
        debug!("vm does not exist");
        return Ok(false);
    };
    if scope.machine.phase() != Some(phases::PROVISIONING) {
        return Ok(true);
    }

    let vm = VirtualMachine::load(scope.session.vim.clone(), reference).await?;
    if vm.properties.power_state == PowerState::PoweredOn {
        return Ok(true);
    }
    let state = vm.instance_state();
    info!(vm = %vm.name(), %state, "vm exists but is not powered on while provisioning");
    scope.provider_status.instance_state = Some(state);
    scope.patch_machine().await?;
    Ok(false)
}

/// Reflect the VM into the Machine: tags, region/zone labels, provider id,
/// addresses and power state
#[instrument(skip_all, fields(machine = %scope.name()))]
pub async fn update(scope: &mut MachineScope) -> Result<()> {
    if !scope.provider_status.task_ref.is_empty() {
        let task_ref = scope.provider_status.task_ref.clone();
        match check_task(scope.vim(), &task_ref).await? {
            TaskOutcome::Unfinished { description_id } => {
                return Err(Error::requeue(format!(
                    "{description_id} task {task_ref} has not finished"
                )));
            }
            TaskOutcome::Failed {
                description_id,
                message,
            } => {
                warn!(task = %task_ref, description_id = %description_id, message = %message, "previous task failed");
                scope.provider_status.task_ref.clear();
            }
            TaskOutcome::Succeeded { .. } | TaskOutcome::ServerForgot => {
                scope.provider_status.task_ref.clear();
            }
        }
    }

    let reference = match find_vm(scope).await? {
        VmLookup::Found(reference) => reference,
        VmLookup::NotFound(_) => {
            return Err(Error::update_machine(&scope.name(), "vm not found on update"))
        }
    };
    let vm = VirtualMachine::load(scope.session.vim.clone(), reference).await?;

    let cluster_id = scope
        .machine
        .label(MACHINE_CLUSTER_ID_LABEL)
        .unwrap_or_default()
        .to_string();
    vm.reconcile_tags(&scope.session.tags, &cluster_id, &scope.provider_spec.tag_ids)
        .await?;

    let labels = cloud_config::region_zone_labels(scope.kube.as_ref()).await?;
    let found = vm.region_zone(&scope.session.tags, &labels).await?;
    let machine_labels = scope.machine.metadata.labels.get_or_insert_with(Default::default);
    if let Some(region) = found.region {
        machine_labels.insert(MACHINE_REGION_LABEL.to_string(), region);
    }
    if let Some(zone) = found.zone {
        machine_labels.insert(MACHINE_ZONE_LABEL.to_string(), zone);
    }

    scope.machine.spec.provider_id = Some(format!("vsphere://{}", vm.uuid()));
    scope
        .machine
        .status
        .get_or_insert_with(Default::default)
        .addresses = vm.addresses();
    scope
        .machine
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            INSTANCE_STATE_ANNOTATION.to_string(),
            vm.instance_state().to_string(),
        );
    record_vm(scope, &vm);
    Ok(())
}

/// Tear the VM down one step at a time
///
/// Returns `Ok` only once the VM is gone. Every step that launched work
/// returns a requeue error.
#[instrument(skip_all, fields(machine = %scope.name()))]
pub async fn delete(scope: &mut MachineScope) -> Result<()> {
    let name = scope.name();

    if !scope.provider_status.task_ref.is_empty() {
        let task_ref = scope.provider_status.task_ref.clone();
        let outcome = check_task(scope.vim(), &task_ref).await?;
        match &outcome {
            TaskOutcome::Unfinished { description_id } => {
                return Err(Error::requeue(format!(
                    "{description_id} task {task_ref} has not finished"
                )));
            }
            TaskOutcome::Failed {
                description_id,
                message,
            } => {
                scope.provider_status.task_ref.clear();
                if !outcome.is_clone() {
                    return Err(Error::delete_machine(
                        &name,
                        format!("{description_id} task {task_ref} failed: {message}"),
                    ));
                }
                warn!(task = %task_ref, message = %message, "clone task had failed, continuing with delete");
            }
            TaskOutcome::Succeeded { .. } | TaskOutcome::ServerForgot => {
                scope.provider_status.task_ref.clear();
            }
        }
    }

    let reference = match find_vm(scope).await? {
        VmLookup::Found(reference) => reference,
        VmLookup::NotFound(uuid) => {
            info!(instance_uuid = %uuid, "vm not found, releasing ip address claims");
            ipam::remove_claim_finalizers(scope.kube.as_ref(), &scope.namespace(), &name).await?;
            return Ok(());
        }
    };
    let vm = VirtualMachine::load(scope.session.vim.clone(), reference).await?;
    record_vm(scope, &vm);

    let drain_skipped = scope.machine.has_annotation(EXCLUDE_NODE_DRAINING_ANNOTATION);
    if !drain_skipped {
        if let Some(node) = scope.machine.node_name() {
            drain::ensure_volumes_detached(scope.kube.as_ref(), node).await?;
        }
    }

    let expected = 1 + scope.provider_spec.data_disks.len();
    let attached = vm.disk_count();
    if attached > expected {
        if drain_skipped {
            vm.detach_disks(&vm.foreign_disks(&name)).await?;
            return Err(Error::requeue(
                "disks were detached, vm will be attempted to destroy in next reconciliation, requeuing",
            ));
        }
        return Err(Error::requeue(format!(
            "vm has {attached} disks attached, expected {expected}, \
             waiting for the attach-detach controller to detach them, requeuing"
        )));
    }

    if vm.is_powered_on() {
        scope.provider_status.task_ref = vm.power_off().await?;
        return Err(Error::requeue("powering off vm is in progress, requeuing"));
    }

    if let Some(group) = scope.provider_spec.workspace().vm_group() {
        vm_group::update_membership(scope.vim(), &name, &vm.reference, group, Membership::Remove)
            .await?;
    }

    scope.provider_status.task_ref = vm.destroy().await?;
    Err(Error::requeue("destroying vm in progress, requeuing"))
}

fn record_vm(scope: &mut MachineScope, vm: &VirtualMachine) {
    scope.provider_status.instance_id = Some(vm.uuid().to_string());
    scope.provider_status.instance_state = Some(vm.instance_state());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        machine_with, provider_spec, Harness, CLUSTER_ID, MACHINE_NAME, MACHINE_UID, NAMESPACE,
    };
    use crate::status::condition;
    use k8s_openapi::api::core::v1::{AttachedVolume, Node, NodeCondition, NodeStatus};
    use kube::core::ObjectMeta;
    use kube::ResourceExt;
    use machine_api_common::crd::{
        AddressesFromPool, ConfigMapFileReference, DataDisk, Infrastructure,
        InfrastructureSpec, Machine, MachineStatus, NodeReference, VSphereMachineProviderStatus,
    };
    use machine_api_common::{FeatureGates, INFRASTRUCTURE_NAME, OPENSHIFT_CONFIG_NAMESPACE};
    use std::collections::BTreeMap;
    use vsphere_client::simulator::{
        DESTROY_TASK, POWER_OFF_TASK, POWER_ON_TASK, RECONFIGURE_TASK,
    };
    use vsphere_client::{MoRef, VimClient};

    fn provider_status(machine: &Machine) -> VSphereMachineProviderStatus {
        machine
            .status
            .as_ref()
            .and_then(|s| s.provider_status.clone())
            .map(|v| serde_json::from_value(v).expect("provider status should decode"))
            .unwrap_or_default()
    }

    fn with_phase(mut machine: Machine, phase: &str) -> Machine {
        machine.status.get_or_insert_with(MachineStatus::default).phase = Some(phase.to_string());
        machine
    }

    fn with_annotation(mut machine: Machine, key: &str) -> Machine {
        machine
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), String::new());
        machine
    }

    async fn create_once(h: &Harness) -> Result<()> {
        let mut scope = h.scope(&h.stored()).await?;
        let result = create(&mut scope).await;
        scope.patch_machine().await?;
        result
    }

    async fn update_once(h: &Harness) -> Result<bool> {
        let mut scope = h.scope(&h.stored()).await?;
        update(&mut scope).await?;
        scope.patch_machine().await
    }

    async fn delete_once(h: &Harness) -> Result<()> {
        let mut scope = h.scope(&h.stored()).await?;
        let result = delete(&mut scope).await;
        scope.patch_machine().await?;
        result
    }

    async fn exists_once(h: &Harness) -> Result<bool> {
        let mut scope = h.scope(&h.stored()).await?;
        exists(&mut scope).await
    }

    fn stored_task(h: &Harness) -> MoRef {
        MoRef::task(provider_status(&h.stored()).task_ref)
    }

    // =========================================================================
    // Create Tests
    // =========================================================================

    #[tokio::test]
    async fn create_clones_then_powers_on() {
        let h = Harness::new();
        h.store(h.machine());

        create_once(&h).await.unwrap();
        let status = provider_status(&h.stored());
        assert!(!status.task_ref.is_empty());
        assert_eq!(h.sim.clone_requests().len(), 1);
        assert!(crate::status::is_true(&status, condition_types::MACHINE_CREATION));

        h.sim.complete_tasks();
        create_once(&h).await.unwrap();
        let status = provider_status(&h.stored());
        assert_eq!(h.sim.tasks_named(POWER_ON_TASK).len(), 1);
        assert_eq!(stored_task(&h), h.sim.tasks_named(POWER_ON_TASK)[0].task);
        assert_eq!(status.instance_state, Some(InstanceState::PoweredOff));

        let vm = h.sim.vm_by_name(MACHINE_NAME).unwrap();
        let props = h.sim.vm(&vm).unwrap();
        assert_eq!(props.instance_uuid, MACHINE_UID);
        assert_eq!(status.instance_id.as_deref(), Some(props.uuid.as_str()));

        h.sim.complete_tasks();
        create_once(&h).await.unwrap();
        assert!(h.sim.vm(&vm).unwrap().power_state == PowerState::PoweredOn);
        assert!(provider_status(&h.stored()).task_ref.is_empty());
        assert_eq!(h.sim.clone_requests().len(), 1);
        assert_eq!(h.sim.tasks_named(POWER_ON_TASK).len(), 1);
    }

    #[tokio::test]
    async fn unfinished_task_blocks_new_work() {
        let h = Harness::new();
        h.store(h.machine());
        create_once(&h).await.unwrap();

        for _ in 0..3 {
            let err = create_once(&h).await.unwrap_err();
            assert!(err.is_requeue());
            assert!(err.to_string().contains("has not finished"));
        }
        assert_eq!(h.sim.clone_requests().len(), 1);
        assert!(h.sim.tasks_named(POWER_ON_TASK).is_empty());
    }

    #[tokio::test]
    async fn failed_clone_task_is_fatal() {
        let h = Harness::new();
        h.store(h.machine());
        create_once(&h).await.unwrap();
        h.sim.fail_task(&stored_task(&h), "Insufficient disk space on datastore");

        let err = create_once(&h).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Insufficient disk space"));

        let status = provider_status(&h.stored());
        assert!(status.task_ref.is_empty());
        let creation = condition(&status, condition_types::MACHINE_CREATION).unwrap();
        assert_eq!(creation.status, ConditionStatus::False);
        assert_eq!(creation.reason, reasons::MACHINE_CREATION_FAILED);
        assert!(creation.message.contains("Insufficient disk space"));
    }

    #[tokio::test]
    async fn forgotten_task_is_treated_as_finished() {
        let h = Harness::new();
        h.store(h.machine());
        create_once(&h).await.unwrap();
        h.sim.forget_task(&stored_task(&h));

        create_once(&h).await.unwrap();
        assert_eq!(h.sim.clone_requests().len(), 2);
    }

    #[tokio::test]
    async fn missing_cluster_id_label_is_configuration_error() {
        let h = Harness::new();
        let mut machine = h.machine();
        machine.metadata.labels = None;
        h.store(machine);

        let err = create_once(&h).await.unwrap_err();
        assert!(err.is_invalid_configuration());
        let status = provider_status(&h.stored());
        let creation = condition(&status, condition_types::MACHINE_CREATION).unwrap();
        assert_eq!(creation.status, ConditionStatus::False);
        assert!(creation.message.contains(MACHINE_CLUSTER_ID_LABEL));
        assert!(h.sim.clone_requests().is_empty());
    }

    #[tokio::test]
    async fn gated_options_require_feature_gates() {
        let mut h = Harness::new();
        h.gates = FeatureGates::default()
            .with(Feature::VSphereHostVMGroupZonal, false)
            .with(Feature::VSphereMultiDisk, false);

        let mut spec = provider_spec();
        spec.workspace.as_mut().unwrap().vm_group = Some("zone-a-vms".to_string());
        h.store(machine_with(&spec));
        let err = create_once(&h).await.unwrap_err();
        assert!(err.is_invalid_configuration());
        assert!(err.to_string().contains("VSphereHostVMGroupZonal"));

        let mut spec = provider_spec();
        spec.data_disks = vec![DataDisk {
            name: "etcd".to_string(),
            size_gib: 8,
            provisioning_mode: None,
        }];
        h.store(machine_with(&spec));
        let err = create_once(&h).await.unwrap_err();
        assert!(err.to_string().contains("VSphereMultiDisk"));
        assert!(h.sim.clone_requests().is_empty());
    }

    #[tokio::test]
    async fn unbound_ip_claims_wait_before_cloning() {
        let h = Harness::new();
        let mut spec = provider_spec();
        spec.network.devices[0].addresses_from_pools = vec![AddressesFromPool {
            group: "ipamcontroller.example.io".to_string(),
            resource: "IPPool".to_string(),
            name: "pool-a".to_string(),
        }];
        h.store(machine_with(&spec));

        let err = create_once(&h).await.unwrap_err();
        assert!(err.is_requeue());
        let status = provider_status(&h.stored());
        let claimed = condition(&status, condition_types::IP_ADDRESS_CLAIMED).unwrap();
        assert_eq!(claimed.status, ConditionStatus::False);
        assert_eq!(claimed.reason, reasons::WAITING_FOR_IP_ADDRESS);
        let creation = condition(&status, condition_types::MACHINE_CREATION).unwrap();
        assert_eq!(creation.status, ConditionStatus::False);
        assert!(h.sim.clone_requests().is_empty());

        let claim = ipam::claim_name(MACHINE_NAME, 0, 0);
        h.kube
            .bind_claim(NAMESPACE, &claim, "192.168.1.20", 24, Some("192.168.1.1"));
        create_once(&h).await.unwrap();

        let status = provider_status(&h.stored());
        assert!(crate::status::is_true(&status, condition_types::IP_ADDRESS_CLAIMED));
        let request = h.sim.clone_requests().pop().unwrap();
        let kargs = request
            .spec
            .config
            .extra_config
            .iter()
            .find(|o| o.key == "guestinfo.afterburn.initrd.network-kargs")
            .map(|o| o.value.clone());
        assert_eq!(
            kargs.as_deref(),
            Some("ip=192.168.1.20::192.168.1.1:255.255.255.0:::none")
        );
    }

    #[tokio::test]
    async fn finished_clone_joins_vm_group_before_power_on() {
        let h = Harness::new();
        let mut spec = provider_spec();
        spec.workspace.as_mut().unwrap().vm_group = Some("zone-a-vms".to_string());
        h.store(machine_with(&spec));

        create_once(&h).await.unwrap();
        h.sim.complete_tasks();
        create_once(&h).await.unwrap();

        let vm = h.sim.vm_by_name(MACHINE_NAME).unwrap();
        assert_eq!(h.sim.vm_group("zone-a-vms"), Some(vec![vm]));
        assert_eq!(h.sim.tasks_named(POWER_ON_TASK).len(), 1);
    }

    #[tokio::test]
    async fn forgotten_clone_task_still_joins_vm_group() {
        let h = Harness::new();
        let mut spec = provider_spec();
        spec.workspace.as_mut().unwrap().vm_group = Some("zone-a-vms".to_string());
        h.store(machine_with(&spec));

        create_once(&h).await.unwrap();
        h.sim.complete_tasks();
        h.sim.forget_task(&stored_task(&h));
        create_once(&h).await.unwrap();

        let vm = h.sim.vm_by_name(MACHINE_NAME).unwrap();
        assert_eq!(h.sim.vm_group("zone-a-vms"), Some(vec![vm]));
        assert_eq!(h.sim.tasks_named(POWER_ON_TASK).len(), 1);
    }

    // =========================================================================
    // Exists Tests
    // =========================================================================

    #[tokio::test]
    async fn powered_off_vm_while_provisioning_resumes_power_on() {
        let h = Harness::new();
        h.sim
            .create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.store(with_phase(h.machine(), phases::PROVISIONING));

        assert!(!exists_once(&h).await.unwrap());
        assert_eq!(
            provider_status(&h.stored()).instance_state,
            Some(InstanceState::PoweredOff)
        );

        create_once(&h).await.unwrap();
        assert!(h.sim.clone_requests().is_empty());
        assert_eq!(h.sim.tasks_named(POWER_ON_TASK).len(), 1);
        assert_eq!(stored_task(&h), h.sim.tasks_named(POWER_ON_TASK)[0].task);
    }

    #[tokio::test]
    async fn suspended_vm_while_provisioning_does_not_exist() {
        let h = Harness::new();
        h.sim
            .create_vm(MACHINE_NAME, MACHINE_UID, PowerState::Suspended);
        h.store(with_phase(h.machine(), phases::PROVISIONING));

        assert!(!exists_once(&h).await.unwrap());
        assert_eq!(
            provider_status(&h.stored()).instance_state,
            Some(InstanceState::Suspended)
        );
    }

    #[tokio::test]
    async fn exists_outside_provisioning_ignores_power_state() {
        let h = Harness::new();
        h.sim
            .create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.store(with_phase(h.machine(), phases::RUNNING));

        assert!(exists_once(&h).await.unwrap());
        assert_eq!(h.kube.status_patches(), 0);
    }

    #[tokio::test]
    async fn missing_vm_does_not_exist() {
        let h = Harness::new();
        h.store(h.machine());
        assert!(!exists_once(&h).await.unwrap());
    }

    // =========================================================================
    // Update Tests
    // =========================================================================

    #[tokio::test]
    async fn update_reflects_vm_into_machine() {
        let h = Harness::new();
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        let uuid = h.sim.vm(&vm).unwrap().uuid;
        h.store(h.machine());

        assert!(update_once(&h).await.unwrap());
        let machine = h.stored();
        assert_eq!(machine.spec.provider_id, Some(format!("vsphere://{uuid}")));
        assert_eq!(
            machine.annotations().get(INSTANCE_STATE_ANNOTATION).map(String::as_str),
            Some("poweredOn")
        );
        let addresses = &machine.status.as_ref().unwrap().addresses;
        assert_eq!(addresses.last().unwrap().address, MACHINE_NAME);
        let status = provider_status(&machine);
        assert_eq!(status.instance_id.as_deref(), Some(uuid.as_str()));
        assert_eq!(status.instance_state, Some(InstanceState::PoweredOn));
    }

    #[tokio::test]
    async fn repeated_update_does_not_patch() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.store(h.machine());

        update_once(&h).await.unwrap();
        let version = h.stored().resource_version();
        let (patches, status_patches) = (h.kube.machine_patches(), h.kube.status_patches());

        assert!(!update_once(&h).await.unwrap());
        assert_eq!(h.stored().resource_version(), version);
        assert_eq!(h.kube.machine_patches(), patches);
        assert_eq!(h.kube.status_patches(), status_patches);
    }

    #[tokio::test]
    async fn update_without_vm_fails() {
        let h = Harness::new();
        h.store(h.machine());

        let err = update_once(&h).await.unwrap_err();
        assert!(matches!(err, Error::UpdateMachine { .. }));
        assert!(err.to_string().contains("vm not found on update"));
    }

    #[tokio::test]
    async fn update_waits_for_running_task() {
        let h = Harness::new();
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.store(h.machine());
        let mut scope = h.scope(&h.stored()).await.unwrap();
        scope.provider_status.task_ref = h.sim.session().power_on(&vm).await.unwrap().value;
        scope.patch_machine().await.unwrap();

        let err = update_once(&h).await.unwrap_err();
        assert!(err.is_requeue());
    }

    #[tokio::test]
    async fn update_attaches_cluster_tag() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        let category = h.sim.create_category("openshift-cluster");
        h.sim.create_tag(CLUSTER_ID, &category);
        h.store(h.machine());

        update_once(&h).await.unwrap();
        update_once(&h).await.unwrap();
        assert_eq!(h.sim.rest_calls("attach_tag"), 1);
    }

    #[tokio::test]
    async fn update_sets_region_and_zone_labels() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        let region = h.sim.create_category("region");
        let zone = h.sim.create_category("zone");
        let test_region = h.sim.create_tag("testRegion", &region);
        let test_zone = h.sim.create_tag("testZone", &zone);
        h.sim.attach_tag(&test_region, &h.sim.cluster());
        h.sim.attach_tag(&test_zone, &h.sim.host_folder());
        h.kube.insert_infrastructure(Infrastructure::new(
            INFRASTRUCTURE_NAME,
            InfrastructureSpec {
                cloud_config: Some(ConfigMapFileReference {
                    name: "cloud-provider-config".to_string(),
                    key: "config".to_string(),
                }),
            },
        ));
        h.kube.insert_config_map(
            OPENSHIFT_CONFIG_NAMESPACE,
            "cloud-provider-config",
            &[("config", "[Labels]\nregion = \"region\"\nzone = \"zone\"\n")],
        );
        h.store(h.machine());

        update_once(&h).await.unwrap();
        let machine = h.stored();
        assert_eq!(machine.label(MACHINE_REGION_LABEL), Some("testRegion"));
        assert_eq!(machine.label(MACHINE_ZONE_LABEL), Some("testZone"));
        assert_eq!(machine.label(MACHINE_CLUSTER_ID_LABEL), Some(CLUSTER_ID));
    }

    // =========================================================================
    // Delete Tests
    // =========================================================================

    fn node_with_volumes(ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(MACHINE_NAME.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                volumes_attached: Some(vec![AttachedVolume {
                    name: "kubernetes.io/csi/pvc-1".to_string(),
                    device_path: String::new(),
                }]),
                ..Default::default()
            }),
        }
    }

    fn with_node(mut machine: Machine) -> Machine {
        machine.status.get_or_insert_with(MachineStatus::default).node_ref =
            Some(NodeReference {
                name: MACHINE_NAME.to_string(),
                uid: None,
            });
        machine
    }

    #[tokio::test]
    async fn delete_detaches_extra_disks_when_drain_is_skipped() {
        let h = Harness::new();
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.sim.attach_disk(&vm, "[LocalDS_0] kubevols/pvc-1.vmdk", 1024 * 1024);
        h.sim.attach_disk(&vm, "[LocalDS_0] kubevols/pvc-2.vmdk", 1024 * 1024);
        h.store(with_annotation(h.machine(), EXCLUDE_NODE_DRAINING_ANNOTATION));

        let err = delete_once(&h).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "disks were detached, vm will be attempted to destroy in next reconciliation, requeuing"
        );
        assert_eq!(h.sim.vm(&vm).unwrap().disks().len(), 1);
        assert_eq!(h.sim.tasks_named(RECONFIGURE_TASK).len(), 1);

        let err = delete_once(&h).await.unwrap_err();
        assert!(err.to_string().contains("powering off"));
        assert_eq!(h.sim.tasks_named(POWER_OFF_TASK).len(), 1);
        h.sim.complete_tasks();

        let err = delete_once(&h).await.unwrap_err();
        assert!(err.to_string().contains("destroying vm"));
        assert_eq!(h.sim.tasks_named(DESTROY_TASK).len(), 1);
        h.sim.complete_tasks();

        delete_once(&h).await.unwrap();
        assert!(h.sim.vm_by_name(MACHINE_NAME).is_none());
    }

    #[tokio::test]
    async fn delete_refuses_to_destroy_with_extra_disks() {
        let h = Harness::new();
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.sim.attach_disk(&vm, "[LocalDS_0] kubevols/pvc-1.vmdk", 1024 * 1024);
        h.store(h.machine());

        for _ in 0..2 {
            let err = delete_once(&h).await.unwrap_err();
            assert!(err.is_requeue());
            assert!(err.to_string().contains("attach-detach controller"));
        }
        assert!(h.sim.tasks_named(DESTROY_TASK).is_empty());
        assert!(h.sim.tasks_named(RECONFIGURE_TASK).is_empty());
        assert_eq!(h.sim.vm(&vm).unwrap().disks().len(), 2);
    }

    #[tokio::test]
    async fn delete_keeps_data_disks_in_budget() {
        let h = Harness::new();
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.sim.attach_disk(&vm, "[LocalDS_0] worker-0/worker-0_1.vmdk", 1024 * 1024);
        let mut spec = provider_spec();
        spec.data_disks = vec![DataDisk {
            name: "etcd".to_string(),
            size_gib: 1,
            provisioning_mode: None,
        }];
        h.store(machine_with(&spec));

        let err = delete_once(&h).await.unwrap_err();
        assert!(err.to_string().contains("destroying vm"));
    }

    #[tokio::test]
    async fn ready_node_with_volumes_blocks_delete() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.kube.insert_node(node_with_volumes(true));
        h.store(with_node(h.machine()));

        let err = delete_once(&h).await.unwrap_err();
        assert!(matches!(err, Error::NodeOperational { .. }));
        assert!(h.sim.tasks_named(POWER_OFF_TASK).is_empty());
    }

    #[tokio::test]
    async fn not_ready_node_with_volumes_requeues() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.kube.insert_node(node_with_volumes(false));
        h.store(with_node(h.machine()));

        let err = delete_once(&h).await.unwrap_err();
        assert!(err.is_requeue());
        assert!(err.to_string().contains(MACHINE_NAME));
        assert!(h.sim.tasks_named(POWER_OFF_TASK).is_empty());
    }

    #[tokio::test]
    async fn delete_without_vm_releases_claims() {
        let h = Harness::new();
        let mut spec = provider_spec();
        spec.network.devices[0].addresses_from_pools = vec![AddressesFromPool {
            group: "ipamcontroller.example.io".to_string(),
            resource: "IPPool".to_string(),
            name: "pool-a".to_string(),
        }];
        let machine = h.store(machine_with(&spec));
        ipam::ensure_claims(&h.scope(&machine).await.unwrap())
            .await
            .unwrap();

        delete_once(&h).await.unwrap();
        for claim in h.kube.claims() {
            assert!(claim.finalizers().is_empty());
        }
    }

    #[tokio::test]
    async fn delete_waits_for_running_task() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.store(h.machine());

        delete_once(&h).await.unwrap_err();
        let err = delete_once(&h).await.unwrap_err();
        assert!(err.to_string().contains("has not finished"));
        assert_eq!(h.sim.tasks_named(POWER_OFF_TASK).len(), 1);
    }

    #[tokio::test]
    async fn failed_power_off_is_fatal_to_delete() {
        let h = Harness::new();
        h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOn);
        h.store(h.machine());
        delete_once(&h).await.unwrap_err();
        h.sim.fail_task(&stored_task(&h), "host is in maintenance mode");

        let err = delete_once(&h).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(provider_status(&h.stored()).task_ref.is_empty());
    }

    #[tokio::test]
    async fn failed_clone_does_not_block_delete() {
        let h = Harness::new();
        h.store(h.machine());
        create_once(&h).await.unwrap();
        h.sim.fail_task(&stored_task(&h), "Insufficient disk space on datastore");

        delete_once(&h).await.unwrap();
        assert!(provider_status(&h.stored()).task_ref.is_empty());
    }

    #[tokio::test]
    async fn delete_leaves_vm_group() {
        let h = Harness::new();
        let other = h.sim.create_vm("worker-1", "uid-1", PowerState::PoweredOn);
        let vm = h.sim.create_vm(MACHINE_NAME, MACHINE_UID, PowerState::PoweredOff);
        h.sim.add_vm_group("zone-a-vms", vec![other.clone(), vm]);
        let mut spec = provider_spec();
        spec.workspace.as_mut().unwrap().vm_group = Some("zone-a-vms".to_string());
        h.store(machine_with(&spec));

        delete_once(&h).await.unwrap_err();
        assert_eq!(h.sim.vm_group("zone-a-vms"), Some(vec![other]));
        assert_eq!(h.sim.tasks_named(DESTROY_TASK).len(), 1);
    }
}
