//! Shared fixtures for actuator tests: a stateful in-memory Kubernetes client
//! and a harness wiring it to the vCenter simulator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, ObjectReference, Pod, Secret};
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use machine_api_common::crd::{
    IPAddress, IPAddressClaim, IPAddressSpec, IPAddressClaimStatus, Infrastructure,
    LocalObjectReference, LocalSecretReference, Machine, MachineSpec, NetworkDeviceSpec,
    NetworkSpec, ProviderSpec, VSphereMachineProviderSpec, Workspace,
};
use machine_api_common::events::{EventPublisher, MachineEvent};
use machine_api_common::{FeatureGates, MACHINE_CLUSTER_ID_LABEL};
use vsphere_client::simulator::{Simulator, SIM_PASSWORD, SIM_USERNAME, TEMPLATE_NAME};
use vsphere_client::SessionCache;

use crate::actuator::Actuator;
use crate::client::KubeClient;
use crate::error::{Error, Result};
use crate::scope::{MachineScope, ScopeParams};

pub const NAMESPACE: &str = "openshift-machine-api";
pub const MACHINE_NAME: &str = "worker-0";
pub const MACHINE_UID: &str = "a5764857-ae35-34dc-8f25-a9c9e73aa898";
pub const CLUSTER_ID: &str = "cluster-abc";
pub const SERVER: &str = "127.0.0.1";
pub const CREDENTIALS_SECRET: &str = "vsphere-cloud-credentials";
pub const USER_DATA_SECRET: &str = "worker-user-data";
pub const IGNITION: &str = r#"{"ignition":{"version":"3.2.0"}}"#;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn merged<T: Serialize + DeserializeOwned>(obj: &T, patch: &Value) -> T {
    let mut doc = serde_json::to_value(obj).expect("object should serialize");
    json_patch::merge(&mut doc, patch);
    serde_json::from_value(doc).expect("patched object should deserialize")
}

/// Apply a JSON patch the way the API server would, rejecting ops that do not apply
fn patched<T: Serialize + DeserializeOwned>(obj: &T, patch: &json_patch::Patch) -> Result<T> {
    let mut doc = serde_json::to_value(obj).expect("object should serialize");
    json_patch::patch(&mut doc, patch)
        .map_err(|e| Error::internal(format!("json patch rejected: {e}")))?;
    Ok(serde_json::from_value(doc).expect("patched object should deserialize"))
}

#[derive(Default)]
struct FakeState {
    machines: BTreeMap<Key, Machine>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    infrastructures: BTreeMap<String, Infrastructure>,
    nodes: BTreeMap<String, Node>,
    pods: Vec<Pod>,
    claims: BTreeMap<Key, IPAddressClaim>,
    addresses: BTreeMap<Key, IPAddress>,
    machine_patches: usize,
    status_patches: usize,
    deleted_pods: Vec<String>,
    resource_version: u64,
}

impl FakeState {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-memory API server that applies merge patches and counts writes
#[derive(Default)]
pub struct FakeKube {
    state: Mutex<FakeState>,
}

impl FakeKube {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("mutex should not be poisoned")
    }

    pub fn insert_machine(&self, mut machine: Machine) -> Machine {
        let mut state = self.lock();
        machine.metadata.resource_version = Some(state.bump());
        state.machines.insert(
            key(&machine.namespace().unwrap_or_default(), &machine.name_any()),
            machine.clone(),
        );
        machine
    }

    pub fn machine(&self, namespace: &str, name: &str) -> Machine {
        self.lock()
            .machines
            .get(&key(namespace, name))
            .cloned()
            .expect("machine should exist")
    }

    pub fn machine_patches(&self) -> usize {
        self.lock().machine_patches
    }

    pub fn status_patches(&self) -> usize {
        self.lock().status_patches
    }

    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.lock().secrets.insert(key(namespace, name), secret);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.lock().secrets.remove(&key(namespace, name));
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        self.lock().config_maps.insert(key(namespace, name), config_map);
    }

    pub fn insert_infrastructure(&self, infrastructure: Infrastructure) {
        self.lock()
            .infrastructures
            .insert(infrastructure.name_any(), infrastructure);
    }

    pub fn insert_node(&self, node: Node) {
        self.lock().nodes.insert(node.name_any(), node);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.lock().pods.push(pod);
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.lock().deleted_pods.clone()
    }

    pub fn insert_claim(&self, claim: IPAddressClaim) {
        let mut state = self.lock();
        state.claims.insert(
            key(&claim.namespace().unwrap_or_default(), &claim.name_any()),
            claim,
        );
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<IPAddressClaim> {
        self.lock().claims.get(&key(namespace, name)).cloned()
    }

    pub fn claims(&self) -> Vec<IPAddressClaim> {
        self.lock().claims.values().cloned().collect()
    }

    /// Bind a claim to a freshly created IPAddress of the same name
    pub fn bind_claim(&self, namespace: &str, name: &str, address: &str, prefix: u8, gateway: Option<&str>) {
        let mut state = self.lock();
        let Some(claim) = state.claims.get_mut(&key(namespace, name)) else {
            panic!("claim {namespace}/{name} should exist before binding");
        };
        claim.status = Some(IPAddressClaimStatus {
            address_ref: Some(LocalObjectReference {
                name: name.to_string(),
            }),
        });
        let pool_ref = claim.spec.pool_ref.clone();
        let mut ip = IPAddress::new(
            name,
            IPAddressSpec {
                claim_ref: LocalObjectReference {
                    name: name.to_string(),
                },
                pool_ref,
                address: address.to_string(),
                prefix,
                gateway: gateway.map(str::to_string),
            },
        );
        ip.metadata.namespace = Some(namespace.to_string());
        state.addresses.insert(key(namespace, name), ip);
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        Ok(self.lock().machines.get(&key(namespace, name)).cloned())
    }

    async fn patch_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let mut state = self.lock();
        let current = state
            .machines
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::internal(format!("machine {namespace}/{name} not found")))?;
        let mut updated: Machine = patched(&current, patch)?;
        updated.status = current.status;
        updated.metadata.resource_version = Some(state.bump());
        state.machine_patches += 1;
        state.machines.insert(key(namespace, name), updated);
        Ok(())
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        let mut state = self.lock();
        let current = state
            .machines
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::internal(format!("machine {namespace}/{name} not found")))?;
        let patched: Machine = patched(&current, patch)?;
        let mut updated = current;
        updated.status = patched.status;
        updated.metadata.resource_version = Some(state.bump());
        state.status_patches += 1;
        state.machines.insert(key(namespace, name), updated);
        Ok(())
    }

    async fn merge_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let current = state
            .machines
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::internal(format!("machine {namespace}/{name} not found")))?;
        let patched: Machine = merged(&current, patch);
        let mut updated = current;
        updated.status = patched.status;
        updated.metadata.resource_version = Some(state.bump());
        state.status_patches += 1;
        state.machines.insert(key(namespace, name), updated);
        Ok(())
    }

    async fn add_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        let rv = state.bump();
        if let Some(machine) = state.machines.get_mut(&key(namespace, name)) {
            let finalizers = machine.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
                machine.metadata.resource_version = Some(rv);
            }
        }
        Ok(())
    }

    async fn remove_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(machine) = state.machines.get_mut(&key(namespace, name)) {
            if let Some(finalizers) = machine.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != finalizer);
            }
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.lock().config_maps.get(&key(namespace, name)).cloned())
    }

    async fn get_infrastructure(&self, name: &str) -> Result<Option<Infrastructure>> {
        Ok(self.lock().infrastructures.get(name).cloned())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.lock().nodes.get(name).cloned())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .pods
            .retain(|p| !(p.name_any() == name && p.namespace().as_deref() == Some(namespace)));
        state.deleted_pods.push(format!("{namespace}/{name}"));
        Ok(())
    }

    async fn get_ip_address_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IPAddressClaim>> {
        Ok(self.claim(namespace, name))
    }

    async fn create_ip_address_claim(
        &self,
        namespace: &str,
        claim: &IPAddressClaim,
    ) -> Result<IPAddressClaim> {
        let mut state = self.lock();
        let k = key(namespace, &claim.name_any());
        if state.claims.contains_key(&k) {
            return Err(Error::internal(format!("claim {} already exists", claim.name_any())));
        }
        let mut created = claim.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.bump());
        state.claims.insert(k, created.clone());
        Ok(created)
    }

    async fn list_ip_address_claims(
        &self,
        namespace: &str,
        machine_name: &str,
    ) -> Result<Vec<IPAddressClaim>> {
        Ok(self
            .lock()
            .claims
            .iter()
            .filter(|((ns, _), c)| {
                ns == namespace
                    && c.labels().get(machine_api_common::IP_CLAIM_MACHINE_LABEL)
                        == Some(&machine_name.to_string())
            })
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn patch_ip_address_claim(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let k = key(namespace, name);
        let current = state
            .claims
            .get(&k)
            .cloned()
            .ok_or_else(|| Error::internal(format!("claim {namespace}/{name} not found")))?;
        let updated = merged(&current, patch);
        state.claims.insert(k, updated);
        Ok(())
    }

    async fn get_ip_address(&self, namespace: &str, name: &str) -> Result<Option<IPAddress>> {
        Ok(self.lock().addresses.get(&key(namespace, name)).cloned())
    }
}

/// Provider spec cloning the simulator template with one NIC
pub fn provider_spec() -> VSphereMachineProviderSpec {
    VSphereMachineProviderSpec {
        template: TEMPLATE_NAME.to_string(),
        workspace: Some(Workspace {
            server: Some(SERVER.to_string()),
            datacenter: Some("DC0".to_string()),
            ..Default::default()
        }),
        network: NetworkSpec {
            devices: vec![NetworkDeviceSpec {
                network_name: "VM Network".to_string(),
                ..Default::default()
            }],
        },
        num_cpus: 4,
        num_cores_per_socket: 2,
        memory_mib: 8192,
        disk_gib: 10,
        user_data_secret: Some(LocalSecretReference {
            name: USER_DATA_SECRET.to_string(),
        }),
        credentials_secret: Some(LocalSecretReference {
            name: CREDENTIALS_SECRET.to_string(),
        }),
        ..Default::default()
    }
}

/// Machine carrying `spec` and the cluster id label
pub fn machine_with(spec: &VSphereMachineProviderSpec) -> Machine {
    Machine {
        metadata: ObjectMeta {
            name: Some(MACHINE_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(MACHINE_UID.to_string()),
            labels: Some(BTreeMap::from([(
                MACHINE_CLUSTER_ID_LABEL.to_string(),
                CLUSTER_ID.to_string(),
            )])),
            ..Default::default()
        },
        spec: MachineSpec {
            provider_id: None,
            provider_spec: ProviderSpec {
                value: Some(serde_json::to_value(spec).expect("provider spec should serialize")),
            },
        },
        status: None,
    }
}

/// Publisher that drops every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _machine: &ObjectReference, _event: MachineEvent) {}
}

/// Simulator, fake API server and session cache wired together
pub struct Harness {
    pub sim: Simulator,
    pub kube: Arc<FakeKube>,
    pub sessions: Arc<SessionCache>,
    pub gates: FeatureGates,
}

impl Harness {
    pub fn new() -> Self {
        let sim = Simulator::new();
        let kube = Arc::new(FakeKube::default());
        let (username_key, password_key) =
            (format!("{SERVER}.username"), format!("{SERVER}.password"));
        kube.insert_secret(
            NAMESPACE,
            CREDENTIALS_SECRET,
            &[
                (username_key.as_str(), SIM_USERNAME),
                (password_key.as_str(), SIM_PASSWORD),
            ],
        );
        kube.insert_secret(NAMESPACE, USER_DATA_SECRET, &[("userData", IGNITION)]);
        Self {
            sessions: Arc::new(SessionCache::new(Arc::new(sim.clone()))),
            sim,
            kube,
            gates: FeatureGates::all_enabled(),
        }
    }

    /// Default Machine
    pub fn machine(&self) -> Machine {
        machine_with(&provider_spec())
    }

    /// Store a Machine in the fake API server and return the stored copy
    pub fn store(&self, machine: Machine) -> Machine {
        self.kube.insert_machine(machine)
    }

    /// The stored default Machine
    pub fn stored(&self) -> Machine {
        self.kube.machine(NAMESPACE, MACHINE_NAME)
    }

    pub async fn scope(&self, machine: &Machine) -> Result<MachineScope> {
        MachineScope::new(ScopeParams {
            machine,
            kube: self.kube.clone(),
            sessions: &self.sessions,
            feature_gates: self.gates.clone(),
        })
        .await
    }

    pub fn actuator(&self) -> Actuator {
        Actuator::new(
            self.kube.clone(),
            self.sessions.clone(),
            self.gates.clone(),
            Arc::new(NoopEventPublisher),
        )
    }
}
