//! Per-reconcile machine scope
//!
//! A [`MachineScope`] bundles the Machine being reconciled with its decoded
//! provider spec and status, the vCenter session and a baseline copy taken at
//! construction. [`MachineScope::patch_machine`] writes back a JSON patch of
//! what changed since the baseline, so a reconcile that observes nothing new
//! leaves the resourceVersion alone.

use std::sync::Arc;

use kube::ResourceExt;
use json_patch::Patch;
use serde_json::{json, Value};
use tracing::debug;

use machine_api_common::crd::{Machine, VSphereMachineProviderSpec, VSphereMachineProviderStatus};
use machine_api_common::FeatureGates;
use vsphere_client::{Datacenter, Session, SessionCache, SessionParams, VimClient};

use crate::client::KubeClient;
use crate::error::{Error, Result};

/// Inputs for building a scope
pub struct ScopeParams<'a> {
    /// Machine as observed by the controller
    pub machine: &'a Machine,
    /// Kubernetes API access
    pub kube: Arc<dyn KubeClient>,
    /// Process-wide session cache
    pub sessions: &'a SessionCache,
    /// Enabled feature gates
    pub feature_gates: FeatureGates,
}

/// Everything a single reconcile of one Machine works on
pub struct MachineScope {
    /// Working copy, mutated during the reconcile
    pub machine: Machine,
    /// Decoded `spec.providerSpec.value`
    pub provider_spec: VSphereMachineProviderSpec,
    /// Decoded `status.providerStatus`, written back on patch
    pub provider_status: VSphereMachineProviderStatus,
    /// vCenter session for the Machine's workspace
    pub session: Arc<Session>,
    /// Kubernetes API access
    pub kube: Arc<dyn KubeClient>,
    /// Enabled feature gates
    pub feature_gates: FeatureGates,
    baseline: Machine,
}

impl MachineScope {
    /// Decode the Machine, resolve credentials and obtain a session
    pub async fn new(params: ScopeParams<'_>) -> Result<Self> {
        let mut machine = params.machine.clone();
        let name = machine.name_any();
        let namespace = machine.namespace().unwrap_or_default();

        let provider_spec = decode_provider_spec(&machine)?;
        let provider_status = decode_provider_status(&machine)?;

        let workspace = provider_spec.workspace();
        let server = workspace
            .server()
            .ok_or_else(|| Error::invalid_configuration(&name, "workspace.server is required"))?
            .to_string();

        let (username, password) =
            credentials(params.kube.as_ref(), &name, &namespace, &provider_spec, &server).await?;

        let session = params
            .sessions
            .get_or_create(&SessionParams {
                server,
                datacenter: workspace.datacenter().map(str::to_string),
                username,
                password,
            })
            .await?;

        // Both copies carry the re-encoded status so the diff only sees real changes
        machine.status.get_or_insert_with(Default::default).provider_status =
            Some(serde_json::to_value(&provider_status)?);
        let baseline = machine.clone();

        Ok(Self {
            machine,
            provider_spec,
            provider_status,
            session,
            kube: params.kube,
            feature_gates: params.feature_gates,
            baseline,
        })
    }

    /// Machine name
    pub fn name(&self) -> String {
        self.machine.name_any()
    }

    /// Machine namespace
    pub fn namespace(&self) -> String {
        self.machine.namespace().unwrap_or_default()
    }

    /// Machine UID, used as the VM's instance UUID
    pub fn uid(&self) -> Result<String> {
        self.machine
            .uid()
            .ok_or_else(|| Error::internal(format!("machine {} has no uid", self.name())))
    }

    /// Management API client of the session
    pub fn vim(&self) -> &dyn VimClient {
        self.session.vim.as_ref()
    }

    /// Datacenter lookups are scoped to
    pub fn datacenter(&self) -> &Datacenter {
        &self.session.datacenter
    }

    /// Write changes since the baseline back to the API server
    ///
    /// Metadata and spec changes go through the main resource, status through
    /// the status subresource. Returns whether anything was written.
    pub async fn patch_machine(&mut self) -> Result<bool> {
        self.machine.status.get_or_insert_with(Default::default).provider_status =
            Some(serde_json::to_value(&self.provider_status)?);

        let (resource, status) = machine_patches(&self.baseline, &self.machine)?;
        if resource.0.is_empty() && status.0.is_empty() {
            debug!(machine = %self.name(), "no changes to patch");
            return Ok(false);
        }

        let (name, namespace) = (self.name(), self.namespace());
        if !resource.0.is_empty() {
            self.kube.patch_machine(&namespace, &name, &resource).await?;
        }
        if !status.0.is_empty() {
            self.kube
                .patch_machine_status(&namespace, &name, &status)
                .await?;
        }

        debug!(machine = %name, "patched machine");
        self.baseline = self.machine.clone();
        Ok(true)
    }
}

fn decode_provider_spec(machine: &Machine) -> Result<VSphereMachineProviderSpec> {
    let name = machine.name_any();
    let value = machine
        .spec
        .provider_spec
        .value
        .clone()
        .ok_or_else(|| Error::invalid_configuration(&name, "providerSpec.value is empty"))?;
    serde_json::from_value(value).map_err(|e| {
        Error::invalid_configuration(&name, format!("failed to decode providerSpec: {e}"))
    })
}

fn decode_provider_status(machine: &Machine) -> Result<VSphereMachineProviderStatus> {
    match machine
        .status
        .as_ref()
        .and_then(|s| s.provider_status.clone())
    {
        None | Some(Value::Null) => Ok(VSphereMachineProviderStatus::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| {
            Error::invalid_configuration(
                &machine.name_any(),
                format!("failed to decode providerStatus: {e}"),
            )
        }),
    }
}

async fn credentials(
    kube: &dyn KubeClient,
    name: &str,
    namespace: &str,
    spec: &VSphereMachineProviderSpec,
    server: &str,
) -> Result<(String, String)> {
    let secret_ref = spec
        .credentials_secret
        .as_ref()
        .ok_or_else(|| Error::invalid_configuration(name, "credentialsSecret is required"))?;
    let secret = kube
        .get_secret(namespace, &secret_ref.name)
        .await?
        .ok_or_else(|| {
            Error::invalid_configuration(
                name,
                format!("credentials secret {}/{} not found", namespace, secret_ref.name),
            )
        })?;

    let field = |suffix: &str| -> Result<String> {
        let key = format!("{server}.{suffix}");
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&key))
            .ok_or_else(|| {
                Error::invalid_configuration(
                    name,
                    format!("credentials secret {} has no key {key}", secret_ref.name),
                )
            })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| {
            Error::invalid_configuration(
                name,
                format!("credentials secret {} key {key} is not utf-8", secret_ref.name),
            )
        })
    };
    Ok((field("username")?, field("password")?))
}

/// JSON patches turning `old` into `new`: one for metadata and spec, one for status
pub(crate) fn machine_patches(old: &Machine, new: &Machine) -> Result<(Patch, Patch)> {
    let (old_resource, old_status) = split_status(serde_json::to_value(old)?);
    let (new_resource, new_status) = split_status(serde_json::to_value(new)?);
    Ok((
        json_patch::diff(&old_resource, &new_resource),
        json_patch::diff(&old_status, &new_status),
    ))
}

/// Separate `status` from the rest, keeping it rooted at `/status`
fn split_status(mut doc: Value) -> (Value, Value) {
    let status = doc.as_object_mut().and_then(|o| o.remove("status"));
    let status_doc = match status {
        Some(status) => json!({ "status": status }),
        None => json!({}),
    };
    (doc, status_doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, MACHINE_NAME, NAMESPACE};
    use machine_api_common::crd::InstanceState;

    // =========================================================================
    // Patch Diff Tests
    // =========================================================================

    fn paths(patch: &Patch) -> Vec<String> {
        let value = serde_json::to_value(patch).unwrap();
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|op| format!("{} {}", op["op"].as_str().unwrap(), op["path"].as_str().unwrap()))
            .collect()
    }

    #[test]
    fn identical_machines_produce_empty_patches() {
        let h = Harness::new();
        let machine = h.machine();
        let (resource, status) = machine_patches(&machine, &machine.clone()).unwrap();
        assert!(resource.0.is_empty());
        assert!(status.0.is_empty());
    }

    #[test]
    fn label_change_only_touches_that_label() {
        let h = Harness::new();
        let old = h.machine();
        let mut new = old.clone();
        new.labels_mut().insert("zone".to_string(), "a".to_string());

        let (resource, status) = machine_patches(&old, &new).unwrap();

        assert_eq!(paths(&resource), vec!["add /metadata/labels/zone"]);
        assert!(status.0.is_empty());
    }

    #[test]
    fn status_ops_are_rooted_at_status() {
        let h = Harness::new();
        let old = h.machine();
        let mut new = old.clone();
        new.status.get_or_insert_with(Default::default).provider_status =
            Some(json!({"taskRef": "task-1"}));

        let (resource, status) = machine_patches(&old, &new).unwrap();

        assert!(resource.0.is_empty());
        assert!(!status.0.is_empty());
        assert!(paths(&status).iter().all(|p| p.contains(" /status")));

        let mut doc = serde_json::to_value(&old).unwrap();
        json_patch::patch(&mut doc, &status).unwrap();
        assert_eq!(doc["status"]["providerStatus"]["taskRef"], "task-1");
    }

    #[test]
    fn cleared_status_field_is_removed() {
        let h = Harness::new();
        let mut old = h.machine();
        old.status.get_or_insert_with(Default::default).provider_status =
            Some(json!({"taskRef": "task-1", "instanceId": "abc"}));
        let mut new = old.clone();
        new.status.as_mut().unwrap().provider_status = Some(json!({"taskRef": "task-1"}));

        let (_, status) = machine_patches(&old, &new).unwrap();

        assert_eq!(paths(&status), vec!["remove /status/providerStatus/instanceId"]);
    }

    // =========================================================================
    // Scope Tests
    // =========================================================================

    #[tokio::test]
    async fn scope_decodes_provider_spec_and_logs_in() {
        let h = Harness::new();
        let machine = h.store(h.machine());

        let scope = h.scope(&machine).await.unwrap();

        assert_eq!(scope.provider_spec.template, "DC0_H0_VM0");
        assert_eq!(scope.provider_status.task_ref, "");
        assert_eq!(scope.datacenter().name, "DC0");
        assert_eq!(h.sim.login_count(), 1);
    }

    #[tokio::test]
    async fn unchanged_scope_does_not_patch() {
        let h = Harness::new();
        let machine = h.store(h.machine());
        let mut scope = h.scope(&machine).await.unwrap();

        assert!(!scope.patch_machine().await.unwrap());
        assert_eq!(h.kube.machine_patches(), 0);
        assert_eq!(h.kube.status_patches(), 0);
    }

    #[tokio::test]
    async fn status_changes_go_to_status_subresource() {
        let h = Harness::new();
        let machine = h.store(h.machine());
        let mut scope = h.scope(&machine).await.unwrap();

        scope.provider_status.instance_state = Some(InstanceState::PoweredOff);
        assert!(scope.patch_machine().await.unwrap());

        assert_eq!(h.kube.machine_patches(), 0);
        assert_eq!(h.kube.status_patches(), 1);
        let stored = h.kube.machine(NAMESPACE, MACHINE_NAME);
        let status = stored.status.unwrap().provider_status.unwrap();
        assert_eq!(status["instanceState"], "poweredOff");

        // Second patch with nothing new is skipped
        assert!(!scope.patch_machine().await.unwrap());
        assert_eq!(h.kube.status_patches(), 1);
    }

    #[tokio::test]
    async fn spec_changes_go_to_main_resource() {
        let h = Harness::new();
        let machine = h.store(h.machine());
        let mut scope = h.scope(&machine).await.unwrap();

        scope.machine.spec.provider_id = Some("vsphere://abc".to_string());
        scope.patch_machine().await.unwrap();

        assert_eq!(h.kube.machine_patches(), 1);
        assert_eq!(h.kube.status_patches(), 0);
        assert_eq!(
            h.kube.machine(NAMESPACE, MACHINE_NAME).spec.provider_id.as_deref(),
            Some("vsphere://abc")
        );
    }

    #[tokio::test]
    async fn empty_provider_spec_is_configuration_error() {
        let h = Harness::new();
        let mut machine = h.machine();
        machine.spec.provider_spec.value = None;

        let err = h.scope(&machine).await.err().unwrap();
        assert!(err.is_invalid_configuration());
    }

    #[tokio::test]
    async fn malformed_provider_spec_is_configuration_error() {
        let h = Harness::new();
        let mut machine = h.machine();
        machine.spec.provider_spec.value = Some(json!({"numCPUs": "four"}));

        let err = h.scope(&machine).await.err().unwrap();
        assert!(err.is_invalid_configuration());
    }

    #[tokio::test]
    async fn missing_credential_keys_are_configuration_errors() {
        let h = Harness::new();
        h.kube.insert_secret(
            NAMESPACE,
            crate::test_support::CREDENTIALS_SECRET,
            &[("other-server.username", "user")],
        );

        let err = h.scope(&h.machine()).await.err().unwrap();
        assert!(err.is_invalid_configuration());
        assert!(err.to_string().contains("127.0.0.1.username"));
    }

    #[tokio::test]
    async fn missing_credentials_secret_is_configuration_error() {
        let h = Harness::new();
        h.kube
            .remove_secret(NAMESPACE, crate::test_support::CREDENTIALS_SECRET);

        let err = h.scope(&h.machine()).await.err().unwrap();
        assert!(err.is_invalid_configuration());
    }

    #[tokio::test]
    async fn wrong_password_fails_login() {
        let h = Harness::new();
        h.kube.insert_secret(
            NAMESPACE,
            crate::test_support::CREDENTIALS_SECRET,
            &[("127.0.0.1.username", "user"), ("127.0.0.1.password", "nope")],
        );

        let err = h.scope(&h.machine()).await.err().unwrap();
        assert!(matches!(err, Error::VSphere { ref source } if source.is_not_authenticated()));
    }
}
