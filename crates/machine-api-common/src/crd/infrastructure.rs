//! Cluster-scoped Infrastructure singleton (`config.openshift.io/v1`)
//!
//! Only the pieces the actuator reads are modelled: the cloud-config ConfigMap
//! reference and the infrastructure name used for cluster tags.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired infrastructure configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    plural = "infrastructures",
    status = "InfrastructureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    /// ConfigMap in `openshift-config` holding the cloud provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<ConfigMapFileReference>,
}

/// Reference to a key inside a ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConfigMapFileReference {
    /// ConfigMap name
    #[serde(default)]
    pub name: String,
    /// Key inside the ConfigMap; `config` when empty
    #[serde(default)]
    pub key: String,
}

impl ConfigMapFileReference {
    /// Key to read, applying the default
    pub fn key_or_default(&self) -> &str {
        if self.key.is_empty() {
            "config"
        } else {
            &self.key
        }
    }
}

/// Observed infrastructure state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Unique cluster infrastructure name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_name: Option<String>,
}
