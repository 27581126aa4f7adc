//! IPAM contract types (`ipam.cluster.x-k8s.io/v1beta1`)
//!
//! The actuator creates an `IPAddressClaim` per NIC and pool; an external pool
//! controller binds it to an `IPAddress`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A request for an address from a pool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddressClaim",
    plural = "ipaddressclaims",
    namespaced,
    status = "IPAddressClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimSpec {
    /// Pool to allocate from
    pub pool_ref: TypedLocalObjectReference,
}

/// Observed state of an IPAddressClaim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimStatus {
    /// Bound IPAddress, set by the pool controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_ref: Option<LocalObjectReference>,
}

/// An address allocated from a pool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddress",
    plural = "ipaddresses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    /// Claim this address was allocated for
    pub claim_ref: LocalObjectReference,
    /// Pool the address came from
    pub pool_ref: TypedLocalObjectReference,
    /// The address itself, without prefix
    pub address: String,
    /// Prefix length
    pub prefix: u8,
    /// Gateway advertised by the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Reference to an object of a given kind in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    /// API group of the referenced kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl IPAddressClaim {
    /// Whether the pool controller has bound an address
    pub fn is_bound(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.address_ref.as_ref())
            .is_some_and(|r| !r.name.is_empty())
    }

    /// Name of the bound IPAddress, if any
    pub fn address_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.address_ref.as_ref())
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
    }
}
