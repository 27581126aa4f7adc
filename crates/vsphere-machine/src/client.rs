//! Kubernetes API access for the actuator
//!
//! [`KubeClient`] is the seam tests mock or fake. Every read goes straight to
//! the API server; nothing here is served from a watch cache, which matters for
//! Node reads during deletion where `status.volumesAttached` must be fresh.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use machine_api_common::crd::{IPAddress, IPAddressClaim, Infrastructure, Machine};
use machine_api_common::IP_CLAIM_MACHINE_LABEL;

use crate::error::Result;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "machine-api-vsphere";

/// Trait abstracting the Kubernetes operations the actuator performs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Machine by namespace and name
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>>;

    /// Apply a JSON patch (RFC 6902) to a Machine's metadata and spec
    async fn patch_machine(&self, namespace: &str, name: &str, patch: &json_patch::Patch)
        -> Result<()>;

    /// Apply a JSON patch to a Machine's status subresource
    ///
    /// Operation paths are rooted at the object, i.e. `/status/...`.
    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()>;

    /// Apply a JSON merge patch to a Machine's status subresource
    ///
    /// The patch is the full object shape, i.e. `{"status": {...}}`.
    async fn merge_machine_status(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<()>;

    /// Add a finalizer to a Machine if not already present
    async fn add_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Remove a finalizer from a Machine
    async fn remove_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Get a ConfigMap by namespace and name
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Get the cluster-scoped Infrastructure object
    async fn get_infrastructure(&self, name: &str) -> Result<Option<Infrastructure>>;

    /// Get a Node directly from the API server
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// List pods scheduled to a node, across namespaces
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Delete a pod with a zero grace period
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get an IPAddressClaim by namespace and name
    async fn get_ip_address_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressClaim>>;

    /// Create an IPAddressClaim
    async fn create_ip_address_claim(
        &self,
        namespace: &str,
        claim: &IPAddressClaim,
    ) -> Result<IPAddressClaim>;

    /// List the IPAddressClaims labelled for a Machine
    async fn list_ip_address_claims(
        &self,
        namespace: &str,
        machine_name: &str,
    ) -> Result<Vec<IPAddressClaim>>;

    /// Apply a JSON merge patch to an IPAddressClaim
    async fn patch_ip_address_claim(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<()>;

    /// Get an IPAddress by namespace and name
    async fn get_ip_address(&self, namespace: &str, name: &str) -> Result<Option<IPAddress>>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::<()>::Json(patch.clone()),
        )
        .await?;
        Ok(())
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::<()>::Json(patch.clone()),
        )
        .await?;
        Ok(())
    }

    async fn merge_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn add_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);

        let machine = api.get(name).await?;
        let mut finalizers = machine.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);

        let machine = match api.get(name).await {
            Ok(machine) => machine,
            Err(e) if not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers: Vec<String> = machine
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_infrastructure(&self, name: &str) -> Result<Option<Infrastructure>> {
        let api: Api<Infrastructure> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if not_found(&e) => {
                debug!(pod = %name, namespace = %namespace, "pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_ip_address_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressClaim>> {
        let api: Api<IPAddressClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_ip_address_claim(
        &self,
        namespace: &str,
        claim: &IPAddressClaim,
    ) -> Result<IPAddressClaim> {
        let api: Api<IPAddressClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), claim).await?)
    }

    async fn list_ip_address_claims(
        &self,
        namespace: &str,
        machine_name: &str,
    ) -> Result<Vec<IPAddressClaim>> {
        let api: Api<IPAddressClaim> = Api::namespaced(self.client.clone(), namespace);
        let params =
            ListParams::default().labels(&format!("{IP_CLAIM_MACHINE_LABEL}={machine_name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn patch_ip_address_claim(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<IPAddressClaim> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_ip_address(&self, namespace: &str, name: &str) -> Result<Option<IPAddress>> {
        let api: Api<IPAddress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
