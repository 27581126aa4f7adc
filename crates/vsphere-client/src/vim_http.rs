//! [`VimClient`] over the VI/JSON protocol
//!
//! Properties are read with `GET /sdk/vim25/<release>/<Type>/<id>/<property>` and
//! methods invoked with `POST .../<Type>/<id>/<Method>`. Inventory searches use
//! the `SearchIndex` and short-lived container views.

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{read_json, SESSION_HEADER};
use crate::types::{
    CloneSpec, ClusterConfigInfo, ClusterConfigSpec, Datacenter, ManagedEntity, MoRef, Network,
    NetworkBacking, PowerState, TaskInfo, VmConfigSpec, VmProperties,
};
use crate::vim::VimClient;
use crate::wire;

/// API release the client speaks
pub const VIM_RELEASE: &str = "8.0.1.0";

/// Managed objects every call path needs
#[derive(Clone, Debug)]
struct ServiceContent {
    root_folder: MoRef,
    search_index: MoRef,
    view_manager: MoRef,
    session_manager: MoRef,
}

/// VI/JSON client bound to one logged-in session
pub struct HttpVimClient {
    http: reqwest::Client,
    base: Url,
    session_id: String,
    content: ServiceContent,
}

impl HttpVimClient {
    /// Log in and return a client bound to the new session
    pub async fn login(
        http: reqwest::Client,
        server: &Url,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let base = server
            .join(&format!("sdk/vim25/{VIM_RELEASE}/"))
            .map_err(|e| Error::invalid_argument(e.to_string()))?;

        let content_url = base
            .join("ServiceInstance/ServiceInstance/content")
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let content = read_json(http.get(content_url).send().await?, wire::decode_fault).await?;
        let content = ServiceContent {
            root_folder: field_moref(&content, "rootFolder")?,
            search_index: field_moref(&content, "searchIndex")?,
            view_manager: field_moref(&content, "viewManager")?,
            session_manager: field_moref(&content, "sessionManager")?,
        };

        let login_url = base
            .join(&format!(
                "SessionManager/{}/Login",
                content.session_manager.value
            ))
            .map_err(|e| Error::invalid_argument(e.to_string()))?;
        let response = http
            .post(login_url)
            .json(&json!({ "userName": username, "password": password }))
            .send()
            .await?;
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        read_json(response, wire::decode_fault).await?;
        let session_id = session_id
            .ok_or_else(|| Error::not_authenticated("login response carried no session id"))?;

        debug!(server = %server, username, "vCenter login succeeded");
        Ok(Self {
            http,
            base,
            session_id,
            content,
        })
    }

    fn url(&self, reference: &MoRef, suffix: &str) -> Result<Url> {
        self.base
            .join(&format!("{}/{}/{}", reference.type_, reference.value, suffix))
            .map_err(|e| Error::invalid_argument(e.to_string()))
    }

    async fn get(&self, reference: &MoRef, property: &str) -> Result<Value> {
        let response = self
            .http
            .get(self.url(reference, property)?)
            .header(SESSION_HEADER, &self.session_id)
            .send()
            .await?;
        read_json(response, wire::decode_fault).await
    }

    async fn invoke(&self, reference: &MoRef, method: &str, body: Value) -> Result<Value> {
        let response = self
            .http
            .post(self.url(reference, method)?)
            .header(SESSION_HEADER, &self.session_id)
            .json(&body)
            .send()
            .await?;
        read_json(response, wire::decode_fault).await
    }

    async fn invoke_task(&self, reference: &MoRef, method: &str, body: Value) -> Result<MoRef> {
        let task = self.invoke(reference, method, body).await?;
        wire::decode_moref(&task)
    }

    async fn name_of(&self, reference: &MoRef) -> Result<String> {
        let name = self.get(reference, "name").await?;
        name.as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::decode(format!("{reference} has no name")))
    }

    async fn find_by_inventory_path(&self, path: &str) -> Result<Option<MoRef>> {
        let found = self
            .invoke(
                &self.content.search_index,
                "FindByInventoryPath",
                json!({ "inventoryPath": path }),
            )
            .await?;
        wire::decode_optional_moref(Some(&found))
    }

    /// All objects of `type_` below `container`
    async fn list_view(&self, container: &MoRef, type_: &str) -> Result<Vec<MoRef>> {
        let view = self
            .invoke(
                &self.content.view_manager,
                "CreateContainerView",
                json!({
                    "container": wire::encode_moref(container),
                    "type": [type_],
                    "recursive": true,
                }),
            )
            .await?;
        let view = wire::decode_moref(&view)?;
        let members = self.get(&view, "view").await;
        if let Err(e) = self.invoke(&view, "DestroyView", json!({})).await {
            warn!(view = %view, error = %e, "failed to destroy container view");
        }
        wire::decode_moref_list(&members?)
    }

    /// Resolve `path` to exactly one object of `type_` below `container`
    ///
    /// Absolute paths go through the search index, relative ones are resolved
    /// under `relative_root`, and bare names are matched across the container.
    async fn resolve(
        &self,
        kind: &str,
        type_: &str,
        container: &MoRef,
        relative_root: &str,
        path: &str,
    ) -> Result<MoRef> {
        if path.contains('/') {
            let full = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("{}/{}", relative_root.trim_end_matches('/'), path)
            };
            return match self.find_by_inventory_path(&full).await? {
                Some(found) if found.is(type_) => Ok(found),
                _ => Err(Error::not_found(kind, path)),
            };
        }

        let mut matches = Vec::new();
        for candidate in self.list_view(container, type_).await? {
            if self.name_of(&candidate).await? == path {
                matches.push(candidate);
            }
        }
        single(kind, path, matches)
    }

    async fn datacenter_from_ref(&self, reference: MoRef) -> Result<Datacenter> {
        let name = self.name_of(&reference).await?;
        Ok(Datacenter {
            vm_folder: wire::decode_moref(&self.get(&reference, "vmFolder").await?)?,
            host_folder: wire::decode_moref(&self.get(&reference, "hostFolder").await?)?,
            datastore_folder: wire::decode_moref(&self.get(&reference, "datastoreFolder").await?)?,
            network_folder: wire::decode_moref(&self.get(&reference, "networkFolder").await?)?,
            path: format!("/{name}"),
            name,
            reference,
        })
    }

    async fn network_backing(&self, network: &MoRef, name: &str) -> Result<Option<NetworkBacking>> {
        match network.type_.as_str() {
            "Network" => Ok(Some(NetworkBacking::Network {
                device_name: name.to_string(),
                network: network.clone(),
            })),
            "DistributedVirtualPortgroup" => {
                let config = self.get(network, "config").await?;
                let switch = config
                    .get("distributedVirtualSwitch")
                    .map(wire::decode_moref)
                    .transpose()?
                    .ok_or_else(|| Error::decode("portgroup without switch"))?;
                let switch_uuid = self
                    .get(&switch, "uuid")
                    .await?
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_default();
                Ok(Some(NetworkBacking::DistributedPortgroup {
                    switch_uuid,
                    portgroup_key: config
                        .get("key")
                        .and_then(Value::as_str)
                        .unwrap_or(network.value.as_str())
                        .to_string(),
                }))
            }
            _ => Ok(None),
        }
    }
}

fn field_moref(value: &Value, field: &str) -> Result<MoRef> {
    value
        .get(field)
        .map(wire::decode_moref)
        .transpose()?
        .ok_or_else(|| Error::decode(format!("service content without {field}")))
}

fn single(kind: &str, name: &str, mut matches: Vec<MoRef>) -> Result<MoRef> {
    match matches.len() {
        0 => Err(Error::not_found(kind, name)),
        1 => Ok(matches.remove(0)),
        _ => Err(Error::multiple_found(kind, name)),
    }
}

#[async_trait]
impl VimClient for HttpVimClient {
    async fn session_is_active(&self) -> Result<bool> {
        match self
            .get(&self.content.session_manager, "currentSession")
            .await
        {
            Ok(session) => Ok(!session.is_null()),
            Err(e) if e.is_not_authenticated() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self) -> Result<()> {
        match self
            .invoke(&self.content.session_manager, "Logout", json!({}))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_authenticated() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn find_datacenter(&self, path: Option<&str>) -> Result<Datacenter> {
        let reference = match path {
            Some(path) => {
                let full = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                match self.find_by_inventory_path(&full).await? {
                    Some(found) if found.is("Datacenter") => found,
                    _ => return Err(Error::not_found("datacenter", path)),
                }
            }
            None => {
                let all = self
                    .list_view(&self.content.root_folder, "Datacenter")
                    .await?;
                single("datacenter", "*", all)?
            }
        };
        self.datacenter_from_ref(reference).await
    }

    async fn find_folder(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        match path {
            None => Ok(dc.vm_folder.clone()),
            Some(path) => {
                self.resolve(
                    "folder",
                    "Folder",
                    &dc.vm_folder,
                    &format!("{}/vm", dc.path),
                    path,
                )
                .await
            }
        }
    }

    async fn find_datastore(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        match path {
            None => {
                let all = wire::decode_moref_list(&self.get(&dc.reference, "datastore").await?)?;
                single("datastore", "*", all)
            }
            Some(path) => {
                self.resolve(
                    "datastore",
                    "Datastore",
                    &dc.datastore_folder,
                    &format!("{}/datastore", dc.path),
                    path,
                )
                .await
            }
        }
    }

    async fn find_resource_pool(&self, dc: &Datacenter, path: Option<&str>) -> Result<MoRef> {
        match path {
            None => {
                let mut roots = Vec::new();
                for pool in self.list_view(&dc.host_folder, "ResourcePool").await? {
                    let parent = wire::decode_optional_moref(Some(&self.get(&pool, "parent").await?))?;
                    if parent.is_some_and(|p| !p.is("ResourcePool")) {
                        roots.push(pool);
                    }
                }
                single("resource pool", "*/Resources", roots)
            }
            Some(path) => {
                self.resolve(
                    "resource pool",
                    "ResourcePool",
                    &dc.host_folder,
                    &format!("{}/host", dc.path),
                    path,
                )
                .await
            }
        }
    }

    async fn find_virtual_machine(&self, dc: &Datacenter, path: &str) -> Result<MoRef> {
        self.resolve(
            "vm",
            "VirtualMachine",
            &dc.vm_folder,
            &format!("{}/vm", dc.path),
            path,
        )
        .await
    }

    async fn find_by_instance_uuid(&self, dc: &Datacenter, uuid: &str) -> Result<Option<MoRef>> {
        let found = self
            .invoke(
                &self.content.search_index,
                "FindByUuid",
                json!({
                    "datacenter": wire::encode_moref(&dc.reference),
                    "uuid": uuid,
                    "vmSearch": true,
                    "instanceUuid": true,
                }),
            )
            .await?;
        wire::decode_optional_moref(Some(&found))
    }

    async fn vm_properties(&self, vm: &MoRef) -> Result<VmProperties> {
        let name = self.name_of(vm).await?;
        let config = self.get(vm, "config").await?;
        let runtime = self.get(vm, "runtime").await?;
        let guest = self.get(vm, "guest").await?;
        let snapshot = self.get(vm, "snapshot").await?;
        let pool = self.get(vm, "resourcePool").await?;

        let power_state: PowerState = runtime
            .get("powerState")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| Error::decode(format!("{vm} has no power state")))?;

        let devices = config
            .pointer("/hardware/device")
            .and_then(Value::as_array)
            .map(|devices| {
                devices
                    .iter()
                    .map(wire::decode_device)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let text = |field: &str| {
            config
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(VmProperties {
            reference: vm.clone(),
            name,
            uuid: text("uuid"),
            instance_uuid: text("instanceUuid"),
            version: text("version"),
            power_state,
            devices,
            guest_nics: wire::decode_guest_nics(&guest),
            snapshot: wire::decode_snapshot_info(&snapshot)?,
            host: wire::decode_optional_moref(runtime.get("host"))?,
            resource_pool: wire::decode_optional_moref(Some(&pool))?,
        })
    }

    async fn managed_entity(&self, obj: &MoRef) -> Result<ManagedEntity> {
        Ok(ManagedEntity {
            reference: obj.clone(),
            name: self.name_of(obj).await?,
            parent: wire::decode_optional_moref(Some(&self.get(obj, "parent").await?))?,
        })
    }

    async fn resource_pool_owner(&self, pool: &MoRef) -> Result<MoRef> {
        wire::decode_moref(&self.get(pool, "owner").await?)
    }

    async fn cluster_networks(&self, cluster: &MoRef) -> Result<Vec<Network>> {
        let refs = wire::decode_moref_list(&self.get(cluster, "network").await?)?;
        let mut networks = Vec::with_capacity(refs.len());
        for reference in refs {
            let name = self.name_of(&reference).await?;
            match self.network_backing(&reference, &name).await? {
                Some(backing) => networks.push(Network {
                    reference,
                    name,
                    backing,
                }),
                None => debug!(network = %reference, "skipping network with unsupported type"),
            }
        }
        Ok(networks)
    }

    async fn cluster_configuration(&self, cluster: &MoRef) -> Result<ClusterConfigInfo> {
        wire::decode_cluster_config(&self.get(cluster, "configurationEx").await?)
    }

    async fn clone_vm(
        &self,
        template: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<MoRef> {
        self.invoke_task(
            template,
            "CloneVM_Task",
            json!({
                "folder": wire::encode_moref(folder),
                "name": name,
                "spec": wire::encode_clone_spec(spec),
            }),
        )
        .await
    }

    async fn power_on(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task(vm, "PowerOnVM_Task", json!({})).await
    }

    async fn power_off(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task(vm, "PowerOffVM_Task", json!({})).await
    }

    async fn destroy(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task(vm, "Destroy_Task", json!({})).await
    }

    async fn reconfigure_vm(&self, vm: &MoRef, spec: &VmConfigSpec) -> Result<MoRef> {
        self.invoke_task(
            vm,
            "ReconfigVM_Task",
            json!({ "spec": wire::encode_config_spec(spec) }),
        )
        .await
    }

    async fn reconfigure_cluster(
        &self,
        cluster: &MoRef,
        spec: &ClusterConfigSpec,
    ) -> Result<MoRef> {
        self.invoke_task(
            cluster,
            "ReconfigureComputeResource_Task",
            json!({ "spec": wire::encode_cluster_config_spec(spec), "modify": true }),
        )
        .await
    }

    async fn task_info(&self, task: &MoRef) -> Result<TaskInfo> {
        wire::decode_task_info(&self.get(task, "info").await?)
    }
}
