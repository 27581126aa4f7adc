//! Membership of a VM in a cluster VM group
//!
//! VM groups pin VMs to a host group through an affinity rule configured by
//! the installer. The actuator only edits the VM list of an existing or new
//! group; rules are out of its hands.

use std::time::Duration;

use tracing::{debug, info};

use vsphere_client::{
    wait_for_task, ArrayOperation, ClusterConfigSpec, ClusterGroupSpec, ClusterVmGroup, MoRef,
    VimClient,
};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TIMEOUT: Duration = Duration::from_secs(120);

/// Desired membership change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// Make the VM a member
    Add,
    /// Drop the VM from the group
    Remove,
}

/// Cluster group change for the desired membership, `None` when already there
fn group_change(
    existing: Option<&ClusterVmGroup>,
    group: &str,
    vm: &MoRef,
    membership: Membership,
) -> Option<ClusterGroupSpec> {
    match (membership, existing) {
        (Membership::Add, None) => Some(ClusterGroupSpec {
            operation: ArrayOperation::Add,
            info: ClusterVmGroup {
                name: group.to_string(),
                vm: vec![vm.clone()],
            },
        }),
        (Membership::Add, Some(g)) if g.vm.contains(vm) => None,
        (Membership::Add, Some(g)) => {
            let mut info = g.clone();
            info.vm.push(vm.clone());
            Some(ClusterGroupSpec {
                operation: ArrayOperation::Edit,
                info,
            })
        }
        (Membership::Remove, Some(g)) if g.vm.contains(vm) => {
            let mut info = g.clone();
            info.vm.retain(|member| member != vm);
            Some(ClusterGroupSpec {
                operation: ArrayOperation::Edit,
                info,
            })
        }
        (Membership::Remove, _) => None,
    }
}

/// Bring `vm`'s membership in `group` to the desired state
///
/// The cluster is the owner of the VM's resource pool and must be a compute
/// cluster. The reconfigure task is waited for.
pub async fn update_membership(
    vim: &dyn VimClient,
    machine: &str,
    vm: &MoRef,
    group: &str,
    membership: Membership,
) -> Result<()> {
    let properties = vim.vm_properties(vm).await?;
    let pool = properties
        .resource_pool
        .ok_or_else(|| Error::internal(format!("vm {vm} has no resource pool")))?;
    let cluster = vim.resource_pool_owner(&pool).await?;
    if !cluster.is("ClusterComputeResource") {
        return Err(Error::invalid_configuration(
            machine,
            format!("owner of resource pool {pool} is {cluster}, not a compute cluster"),
        ));
    }

    let configuration = vim.cluster_configuration(&cluster).await?;
    let Some(change) = group_change(configuration.vm_group(group), group, vm, membership) else {
        debug!(vm = %vm, group, ?membership, "vm group already in desired state");
        return Ok(());
    };

    info!(vm = %vm, group, ?membership, "updating vm group");
    let task = vim
        .reconfigure_cluster(
            &cluster,
            &ClusterConfigSpec {
                group_spec: vec![change],
            },
        )
        .await?;
    wait_for_task(vim, &task, POLL_INTERVAL, TIMEOUT).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsphere_client::simulator::{Simulator, CLUSTER_RECONFIGURE_TASK};
    use vsphere_client::PowerState;

    fn reconfigures(sim: &Simulator) -> usize {
        sim.tasks_named(CLUSTER_RECONFIGURE_TASK).len()
    }

    #[tokio::test]
    async fn add_creates_missing_group() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid", PowerState::PoweredOff);

        update_membership(&sim.session(), "worker-0", &vm, "zone-a-vms", Membership::Add)
            .await
            .unwrap();

        assert_eq!(sim.vm_group("zone-a-vms"), Some(vec![vm]));
    }

    #[tokio::test]
    async fn add_appends_and_is_idempotent() {
        let sim = Simulator::new();
        let other = sim.create_vm("worker-1", "uid-1", PowerState::PoweredOn);
        let vm = sim.create_vm("worker-0", "uid-0", PowerState::PoweredOff);
        sim.add_vm_group("zone-a-vms", vec![other.clone()]);
        let session = sim.session();

        update_membership(&session, "worker-0", &vm, "zone-a-vms", Membership::Add)
            .await
            .unwrap();
        update_membership(&session, "worker-0", &vm, "zone-a-vms", Membership::Add)
            .await
            .unwrap();

        assert_eq!(sim.vm_group("zone-a-vms"), Some(vec![other, vm]));
        assert_eq!(reconfigures(&sim), 1);
    }

    #[tokio::test]
    async fn remove_keeps_other_members() {
        let sim = Simulator::new();
        let other = sim.create_vm("worker-1", "uid-1", PowerState::PoweredOn);
        let vm = sim.create_vm("worker-0", "uid-0", PowerState::PoweredOn);
        sim.add_vm_group("zone-a-vms", vec![other.clone(), vm.clone()]);

        update_membership(&sim.session(), "worker-0", &vm, "zone-a-vms", Membership::Remove)
            .await
            .unwrap();

        assert_eq!(sim.vm_group("zone-a-vms"), Some(vec![other]));
    }

    #[tokio::test]
    async fn remove_from_missing_group_is_noop() {
        let sim = Simulator::new();
        let vm = sim.create_vm("worker-0", "uid-0", PowerState::PoweredOn);

        update_membership(&sim.session(), "worker-0", &vm, "zone-a-vms", Membership::Remove)
            .await
            .unwrap();

        assert_eq!(sim.vm_group("zone-a-vms"), None);
        assert_eq!(reconfigures(&sim), 0);
    }
}
