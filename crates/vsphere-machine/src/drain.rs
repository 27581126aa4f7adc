//! Attached-volume safety before a VM is destroyed
//!
//! Destroying a VM that still has persistent volumes attached deletes the
//! volume disks with it. Before teardown the Node backing the Machine must
//! report no attached volumes.

use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::client::KubeClient;
use crate::error::{Error, Result};

fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

fn attached_volumes(node: &Node) -> usize {
    node.status
        .as_ref()
        .and_then(|s| s.volumes_attached.as_ref())
        .map_or(0, Vec::len)
}

/// Check that the Node no longer has volumes attached
///
/// The Node is read straight from the API server. A missing Node counts as
/// released. While volumes remain, terminating pods on the Node are force
/// deleted once and the reconcile is requeued.
pub async fn ensure_volumes_detached(kube: &dyn KubeClient, node_name: &str) -> Result<()> {
    let Some(node) = kube.get_node(node_name).await? else {
        return Ok(());
    };
    let volumes = attached_volumes(&node);
    if volumes == 0 {
        return Ok(());
    }

    if is_ready(&node) && !is_unschedulable(&node) {
        return Err(Error::NodeOperational {
            node: node_name.to_string(),
        });
    }

    let terminating: Vec<(String, String)> = kube
        .list_pods_on_node(node_name)
        .await?
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_some())
        .map(|p| (p.namespace().unwrap_or_default(), p.name_any()))
        .collect();

    let results = join_all(
        terminating
            .iter()
            .map(|(namespace, name)| kube.force_delete_pod(namespace, name)),
    )
    .await;
    for ((namespace, name), result) in terminating.iter().zip(results) {
        match result {
            Ok(()) => info!(pod = %name, namespace = %namespace, "force deleted terminating pod"),
            Err(e) => warn!(pod = %name, namespace = %namespace, error = %e, "failed to force delete pod"),
        }
    }

    Err(Error::requeue(format!(
        "node {node_name} has {volumes} attached volumes, requeuing"
    )))
}
