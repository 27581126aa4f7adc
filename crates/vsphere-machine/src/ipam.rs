//! IP address claims for NICs that draw addresses from IPAM pools
//!
//! One `IPAddressClaim` per (device, pool) pair, named
//! `<machine>-claim-<device>-<pool>`, owned by the Machine and protected by a
//! finalizer until the Machine's VM is gone.

use std::collections::BTreeMap;

use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use machine_api_common::crd::{
    AddressesFromPool, IPAddressClaim, IPAddressClaimSpec, TypedLocalObjectReference,
};
use machine_api_common::{IP_CLAIM_MACHINE_LABEL, IP_CLAIM_PROTECTION_FINALIZER};

use crate::client::KubeClient;
use crate::error::{Error, Result};
use crate::network::PoolAddress;
use crate::scope::MachineScope;

/// Name of the claim for pool `pool` of device `device`
pub fn claim_name(machine: &str, device: usize, pool: usize) -> String {
    format!("{machine}-claim-{device}-{pool}")
}

fn new_claim(scope: &MachineScope, name: &str, pool: &AddressesFromPool) -> Result<IPAddressClaim> {
    let owner = scope
        .machine
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal(format!("machine {} has no uid", scope.name())))?;
    Ok(IPAddressClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(scope.namespace()),
            labels: Some(BTreeMap::from([(
                IP_CLAIM_MACHINE_LABEL.to_string(),
                scope.name(),
            )])),
            finalizers: Some(vec![IP_CLAIM_PROTECTION_FINALIZER.to_string()]),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: IPAddressClaimSpec {
            pool_ref: TypedLocalObjectReference {
                api_group: Some(pool.group.clone()),
                kind: pool.resource.clone(),
                name: pool.name.clone(),
            },
        },
        status: None,
    })
}

/// Make sure the claim is owned by this Machine, adopting it if unowned
async fn verify_owner(scope: &MachineScope, claim: &IPAddressClaim) -> Result<()> {
    let uid = scope.uid()?;
    let owners = claim.owner_references();
    match owners.iter().find(|o| o.kind == "Machine") {
        Some(owner) if owner.uid == uid => Ok(()),
        Some(owner) => Err(Error::internal(format!(
            "ip address claim {} is owned by machine {} ({}), not {}",
            claim.name_any(),
            owner.name,
            owner.uid,
            scope.name()
        ))),
        None => {
            let owner = scope
                .machine
                .controller_owner_ref(&())
                .ok_or_else(|| Error::internal(format!("machine {} has no uid", scope.name())))?;
            let mut refs = owners.to_vec();
            refs.push(owner);
            info!(claim = %claim.name_any(), machine = %scope.name(), "adopting ip address claim");
            scope
                .kube
                .patch_ip_address_claim(
                    &scope.namespace(),
                    &claim.name_any(),
                    &json!({ "metadata": { "ownerReferences": refs } }),
                )
                .await
        }
    }
}

/// Create missing claims and return how many are still unbound
pub async fn ensure_claims(scope: &MachineScope) -> Result<usize> {
    let namespace = scope.namespace();
    let machine = scope.name();
    let mut outstanding = 0;

    for (d, device) in scope.provider_spec.network.devices.iter().enumerate() {
        for (p, pool) in device.addresses_from_pools.iter().enumerate() {
            let name = claim_name(&machine, d, p);
            let claim = match scope.kube.get_ip_address_claim(&namespace, &name).await? {
                Some(claim) => {
                    verify_owner(scope, &claim).await?;
                    claim
                }
                None => {
                    info!(claim = %name, pool = %pool.name, "creating ip address claim");
                    scope
                        .kube
                        .create_ip_address_claim(&namespace, &new_claim(scope, &name, pool)?)
                        .await?
                }
            };
            if !claim.is_bound() {
                debug!(claim = %name, "ip address claim not bound yet");
                outstanding += 1;
            }
        }
    }
    Ok(outstanding)
}

/// Bound pool addresses per device, in device order
pub async fn pool_addresses(scope: &MachineScope) -> Result<Vec<Vec<PoolAddress>>> {
    let namespace = scope.namespace();
    let machine = scope.name();
    let mut result = Vec::with_capacity(scope.provider_spec.network.devices.len());

    for (d, device) in scope.provider_spec.network.devices.iter().enumerate() {
        let mut addresses = Vec::with_capacity(device.addresses_from_pools.len());
        for p in 0..device.addresses_from_pools.len() {
            let name = claim_name(&machine, d, p);
            let claim = scope
                .kube
                .get_ip_address_claim(&namespace, &name)
                .await?
                .ok_or_else(|| Error::requeue(format!("ip address claim {name} not found")))?;
            let address_name = claim
                .address_name()
                .ok_or_else(|| Error::requeue("waiting for IP address claims to be bound"))?;
            let address = scope
                .kube
                .get_ip_address(&namespace, address_name)
                .await?
                .ok_or_else(|| {
                    Error::requeue(format!("ip address {address_name} for claim {name} not found"))
                })?;
            addresses.push(PoolAddress {
                address: address.spec.address,
                prefix: address.spec.prefix,
                gateway: address.spec.gateway,
            });
        }
        result.push(addresses);
    }
    Ok(result)
}

/// Drop the protection finalizer from every claim created for a Machine
pub async fn remove_claim_finalizers(
    kube: &dyn KubeClient,
    namespace: &str,
    machine: &str,
) -> Result<()> {
    for claim in kube.list_ip_address_claims(namespace, machine).await? {
        let finalizers = claim.finalizers();
        if !finalizers.iter().any(|f| f == IP_CLAIM_PROTECTION_FINALIZER) {
            continue;
        }
        let remaining: Vec<&String> = finalizers
            .iter()
            .filter(|f| *f != IP_CLAIM_PROTECTION_FINALIZER)
            .collect();
        info!(claim = %claim.name_any(), machine, "removing ip address claim finalizer");
        kube.patch_ip_address_claim(
            namespace,
            &claim.name_any(),
            &json!({ "metadata": { "finalizers": remaining } }),
        )
        .await?;
    }
    Ok(())
}
