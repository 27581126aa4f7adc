//! Inventory and VM operations against the vCenter management API
//!
//! [`VimClient`] is the seam between the actuator and vCenter. Long-running
//! operations return the reference of the task the server started; callers
//! decide whether to poll it or hand it off to a later reconcile.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{
    CloneSpec, ClusterConfigInfo, ClusterConfigSpec, Datacenter, ManagedEntity, MoRef, Network,
    TaskInfo, TaskState, VmConfigSpec, VmProperties,
};

/// Trait abstracting the vCenter management API
#[async_trait]
pub trait VimClient: Send + Sync {
    /// Whether the session behind this client is still valid
    async fn session_is_active(&self) -> Result<bool>;

    /// End the session
    async fn logout(&self) -> Result<()>;

    /// Resolve a datacenter by name or path, or the only datacenter when `path` is `None`
    async fn find_datacenter(&self, path: Option<&str>) -> Result<Datacenter>;

    /// Resolve a VM folder, or the datacenter's VM root when `path` is `None`
    async fn find_folder(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef>;

    /// Resolve a datastore, or the only datastore when `path` is `None`
    async fn find_datastore(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef>;

    /// Resolve a resource pool, or the only root pool when `path` is `None`
    async fn find_resource_pool(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef>;

    /// Resolve a VM or template by name or inventory path
    async fn find_virtual_machine(&self, dc: &Datacenter, path: &str) -> Result<MoRef>;

    /// Look a VM up by instance UUID
    async fn find_by_instance_uuid(&self, dc: &Datacenter, uuid: &str) -> Result<Option<MoRef>>;

    /// Read the VM properties the actuator needs
    async fn vm_properties(&self, vm: &MoRef) -> Result<VmProperties>;

    /// Read name and parent of any managed entity
    async fn managed_entity(&self, obj: &MoRef) -> Result<ManagedEntity>;

    /// Compute resource owning a resource pool
    async fn resource_pool_owner(&self, pool: &MoRef) -> Result<MoRef>;

    /// Networks visible to a compute resource
    async fn cluster_networks(&self, cluster: &MoRef) -> Result<Vec<Network>>;

    /// Extended configuration of a compute cluster
    async fn cluster_configuration(&self, cluster: &MoRef) -> Result<ClusterConfigInfo>;

    /// Start a clone of `template` into `folder`
    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef>;

    /// Start powering a VM on
    async fn power_on(&self, vm: &MoRef) -> Result<MoRef>;

    /// Start powering a VM off
    async fn power_off(&self, vm: &MoRef) -> Result<MoRef>;

    /// Start destroying a VM and its disks
    async fn destroy(&self, vm: &MoRef) -> Result<MoRef>;

    /// Start reconfiguring a VM
    async fn reconfigure_vm(&self, vm: &MoRef, spec: &VmConfigSpec) -> Result<MoRef>;

    /// Start reconfiguring a compute cluster
    async fn reconfigure_cluster(&self, cluster: &MoRef, spec: &ClusterConfigSpec)
        -> Result<MoRef>;

    /// Read a task's current info
    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo>;
}

/// Poll a task until it leaves the queued/running states
///
/// Returns the final info on success and the task's fault on error. Only used
/// for short operations; long-running VM tasks are tracked across reconciles.
pub async fn wait_for_task(
    client: &dyn VimClient,
    task: &MoRef,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<TaskInfo> {
    let wait = async {
        loop {
            let info = client.task_info(task).await?;
            match info.state {
                TaskState::Success => return Ok(info),
                TaskState::Error => {
                    let (fault, message) = info
                        .error
                        .map(|e| {
                            (
                                e.fault.unwrap_or_else(|| "TaskError".to_string()),
                                e.localized_message,
                            )
                        })
                        .unwrap_or_else(|| ("TaskError".to_string(), String::new()));
                    return Err(Error::fault(fault, message));
                }
                TaskState::Queued | TaskState::Running | TaskState::Unknown => {
                    debug!(task = %task, state = ?info.state, "waiting for task");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::timeout(format!("waiting for task {}", task.value)))?
}
