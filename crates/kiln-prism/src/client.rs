//! HTTPS implementation of [`PrismApi`] over the Prism Central v4 REST API.
//!
//! Mutations carry a fresh `NTNX-Request-Id` so retried requests are not
//! applied twice, and updates to an existing VM go through a read-modify-write
//! guarded by the entity's `ETag`.

use crate::api::PrismApi;
use crate::config::PrismEndpoint;
use crate::error::{PrismError, ResourceKind, Result};
use crate::types::{
    BootType, BusFamily, Checksum, ChecksumAlgorithm, CategoryEntry, Cluster, CompletionDetail,
    DiskRole, Download, EntityReference, GpuDevice, GuestCustomization, Host, Image,
    ImageCreateRequest, ImageSource, ImageType, Ova, OvaFormat, PowerState, Project, Subnet,
    SubnetType, Task, TaskStatus, TemplateSpec, Vm, VmCreateRequest, VmDisk, VmNic, VmUpdate,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{header, Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::path::Path;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

const VMM: &str = "/api/vmm/v4.0";
const CLUSTERMGMT: &str = "/api/clustermgmt/v4.0";
const NETWORKING: &str = "/api/networking/v4.0";
const PRISM: &str = "/api/prism/v4.0";
/// Projects are only exposed through the v3 API.
const PROJECTS_V3: &str = "/api/nutanix/v3/projects";

const REQUEST_ID_HEADER: &str = "NTNX-Request-Id";
const PAGE_LIMIT: usize = 100;

/// Prism Central client authenticated with basic auth.
pub struct PrismClient {
    http: Client,
    /// Client without an overall timeout, used for file transfers.
    transfer: Client,
    base_url: String,
    authority: String,
    username: String,
    password: String,
}

impl PrismClient {
    /// Build a client for the given endpoint.
    ///
    /// No request is made until the first API call.
    pub fn new(endpoint: &PrismEndpoint) -> Result<Self> {
        endpoint.validate()?;

        let http = Client::builder()
            .connect_timeout(endpoint.connect_timeout)
            .timeout(endpoint.request_timeout)
            .danger_accept_invalid_certs(endpoint.insecure)
            .build()?;
        let transfer = Client::builder()
            .connect_timeout(endpoint.connect_timeout)
            .danger_accept_invalid_certs(endpoint.insecure)
            .build()?;

        tracing::debug!(
            endpoint = %endpoint.authority(),
            insecure = endpoint.insecure,
            "Prism client created"
        );

        Ok(Self {
            http,
            transfer,
            base_url: endpoint.base_url(),
            authority: endpoint.authority(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.build(&self.http, method, path)
            .header(header::ACCEPT, "application/json")
    }

    fn build(&self, client: &Client, method: Method, path: &str) -> RequestBuilder {
        client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Request that changes state; tagged with a unique request id.
    fn mutation(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, path)
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<T> {
        let resp = self.request(Method::GET, path).send().await?;
        let envelope: Envelope<T> = check(resp, kind, id).await?.json().await?;
        envelope
            .data
            .ok_or_else(|| PrismError::InvalidResponse(format!("{path}: missing data")))
    }

    /// Fetch every page of a collection.
    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: ResourceKind,
        filter: Option<String>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 0usize;
        loop {
            let mut req = self.request(Method::GET, path).query(&[
                ("$page", page.to_string()),
                ("$limit", PAGE_LIMIT.to_string()),
            ]);
            if let Some(filter) = &filter {
                req = req.query(&[("$filter", filter)]);
            }
            let resp = check(req.send().await?, kind, path).await?;
            let envelope: Envelope<Vec<T>> = resp.json().await?;
            let batch = envelope.data.unwrap_or_default();
            let fetched = batch.len();
            items.extend(batch);
            if fetched < PAGE_LIMIT {
                break;
            }
            page += 1;
        }
        tracing::trace!(path, count = items.len(), "Listed collection");
        Ok(items)
    }

    /// Send a mutation and return the id of the task carrying it out.
    async fn submit(&self, req: RequestBuilder, kind: ResourceKind, id: &str) -> Result<String> {
        let resp = check(req.send().await?, kind, id).await?;
        let envelope: Envelope<TaskReference> = resp.json().await?;
        envelope
            .data
            .map(|t| t.ext_id)
            .ok_or_else(|| PrismError::InvalidResponse("missing task reference".into()))
    }

    /// Raw entity plus its ETag, for read-modify-write updates.
    async fn fetch_for_update(
        &self,
        path: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<(Value, String)> {
        let resp = check(self.request(Method::GET, path).send().await?, kind, id).await?;
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PrismError::InvalidResponse(format!("{path}: missing ETag")))?;
        let envelope: Envelope<Value> = resp.json().await?;
        let data = envelope
            .data
            .ok_or_else(|| PrismError::InvalidResponse(format!("{path}: missing data")))?;
        Ok((data, etag))
    }

    async fn etag_of(&self, path: &str, kind: ResourceKind, id: &str) -> Result<String> {
        Ok(self.fetch_for_update(path, kind, id).await?.1)
    }

    /// Mutation guarded by the current ETag of the VM.
    async fn vm_action(&self, vm_ext_id: &str, method: Method, path: &str) -> Result<String> {
        let etag = self
            .etag_of(&vm_path(vm_ext_id), ResourceKind::Vm, vm_ext_id)
            .await?;
        let req = self
            .mutation(method, path)
            .header(header::IF_MATCH, etag);
        self.submit(req, ResourceKind::Vm, vm_ext_id).await
    }

    async fn download(&self, path: &str, kind: ResourceKind, id: &str) -> Result<Download> {
        let resp = self
            .build(&self.transfer, Method::GET, path)
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await?;
        let resp = check(resp, kind, id).await?;
        let size = resp.content_length();
        let stream = resp.bytes_stream().map_err(io::Error::other);
        tracing::debug!(path, size, "Download started");
        Ok(Download {
            reader: Box::new(StreamReader::new(Box::pin(stream))),
            size,
        })
    }
}

/// Map a non-success status to an error.
async fn check(resp: Response, kind: ResourceKind, id: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(PrismError::not_found(kind, id));
    }
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), body = %body, "Prism API error");
    Err(PrismError::Api {
        status: status.as_u16(),
        body,
    })
}

/// OData equality filter with quotes escaped.
fn eq_filter(field: &str, value: &str) -> String {
    format!("{field} eq '{}'", value.replace('\'', "''"))
}

fn vm_path(ext_id: &str) -> String {
    format!("{VMM}/ahv/config/vms/{ext_id}")
}

fn image_path(ext_id: &str) -> String {
    format!("{VMM}/content/images/{ext_id}")
}

// ============================================================================
// Wire model
// ============================================================================

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskReference {
    ext_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReference {
    ext_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCluster {
    ext_id: String,
    #[serde(default)]
    name: String,
    config: Option<WireClusterConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireClusterConfig {
    #[serde(default)]
    cluster_function: Vec<String>,
}

impl From<WireCluster> for Cluster {
    fn from(w: WireCluster) -> Self {
        let is_aos = w
            .config
            .map(|c| c.cluster_function.iter().any(|f| f == "AOS"))
            .unwrap_or(false);
        Self {
            ext_id: w.ext_id,
            name: w.name,
            is_aos,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubnet {
    ext_id: String,
    #[serde(default)]
    name: String,
    subnet_type: Option<String>,
    cluster_reference: Option<String>,
    #[serde(default)]
    cluster_reference_list: Vec<String>,
}

impl From<WireSubnet> for Subnet {
    fn from(w: WireSubnet) -> Self {
        let subnet_type = match w.subnet_type.as_deref() {
            Some("OVERLAY") => SubnetType::Overlay,
            _ => SubnetType::Vlan,
        };
        let mut cluster_refs = w.cluster_reference_list;
        cluster_refs.extend(w.cluster_reference);
        Self {
            ext_id: w.ext_id,
            name: w.name,
            subnet_type,
            cluster_refs,
        }
    }
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct V3List<T> {
    #[serde(default)]
    entities: Vec<T>,
}

#[derive(Deserialize)]
struct V3Project {
    metadata: V3Metadata,
    spec: Option<V3Spec>,
}

#[derive(Deserialize)]
struct V3Metadata {
    uuid: String,
}

#[derive(Deserialize)]
struct V3Spec {
    #[serde(default)]
    name: String,
}

impl From<V3Project> for Project {
    fn from(w: V3Project) -> Self {
        Self {
            ext_id: w.metadata.uuid,
            name: w.spec.map(|s| s.name).unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHost {
    ext_id: String,
    #[serde(default)]
    host_name: String,
    cluster: Option<WireHostCluster>,
}

#[derive(Deserialize)]
struct WireHostCluster {
    uuid: Option<String>,
}

impl From<WireHost> for Host {
    fn from(w: WireHost) -> Self {
        Self {
            ext_id: w.ext_id,
            name: w.host_name,
            cluster_ext_id: w.cluster.and_then(|c| c.uuid),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCategory {
    ext_id: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGpuProfile {
    #[serde(alias = "physicalGpuConfig", alias = "virtualGpuConfig")]
    config: WireGpuConfig,
    #[serde(default)]
    allocated_vm_ext_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGpuConfig {
    device_id: Option<i64>,
    #[serde(default)]
    device_name: String,
    vendor_name: Option<String>,
    #[serde(rename = "type")]
    gpu_type: Option<String>,
}

impl From<WireGpuProfile> for GpuDevice {
    fn from(w: WireGpuProfile) -> Self {
        Self {
            device_id: w.config.device_id,
            device_name: w.config.device_name,
            vendor_name: w.config.vendor_name,
            gpu_type: w.config.gpu_type,
            in_use: !w.allocated_vm_ext_ids.is_empty(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireImage {
    ext_id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    image_type: Option<String>,
    source: Option<Value>,
    checksum: Option<WireChecksum>,
    size_bytes: Option<u64>,
    #[serde(default)]
    category_ext_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChecksum {
    #[serde(rename = "$objectType", default)]
    object_type: String,
    hex_digest: String,
}

impl From<WireImage> for Image {
    fn from(w: WireImage) -> Self {
        let image_type = match w.image_type.as_deref() {
            Some("ISO_IMAGE") => ImageType::IsoImage,
            _ => ImageType::DiskImage,
        };
        let source_url = w
            .source
            .as_ref()
            .and_then(|s| s.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let checksum = w.checksum.map(|c| Checksum {
            algorithm: if c.object_type.contains("Sha1") {
                ChecksumAlgorithm::Sha1
            } else {
                ChecksumAlgorithm::Sha256
            },
            value: c.hex_digest,
        });
        Self {
            ext_id: w.ext_id,
            name: w.name,
            image_type,
            source_url,
            checksum,
            size_bytes: w.size_bytes.unwrap_or(0),
            categories: w.category_ext_ids,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireVm {
    ext_id: String,
    #[serde(default)]
    name: String,
    cluster: Option<WireReference>,
    power_state: Option<String>,
    #[serde(default)]
    disks: Vec<WireDisk>,
    #[serde(default)]
    cd_roms: Vec<WireDisk>,
    #[serde(default)]
    nics: Vec<WireNic>,
    guest_customization: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDisk {
    ext_id: Option<String>,
    disk_address: Option<WireDiskAddress>,
    backing_info: Option<WireBacking>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDiskAddress {
    index: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBacking {
    disk_size_bytes: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNic {
    ext_id: Option<String>,
    network_info: Option<WireNetworkInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNetworkInfo {
    subnet: Option<WireReference>,
    ipv4_config: Option<WireIpv4Config>,
    ipv4_info: Option<WireIpv4Info>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIpv4Config {
    ip_address: Option<WireIp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIpv4Info {
    #[serde(default)]
    learned_ip_addresses: Vec<WireIp>,
}

#[derive(Deserialize)]
struct WireIp {
    value: String,
}

impl WireDisk {
    fn into_vm_disk(self, bus: BusFamily) -> VmDisk {
        VmDisk {
            ext_id: self.ext_id.unwrap_or_default(),
            bus,
            index: self.disk_address.and_then(|a| a.index).unwrap_or(0),
            size_bytes: self
                .backing_info
                .and_then(|b| b.disk_size_bytes)
                .unwrap_or(0),
        }
    }
}

impl From<WireNic> for VmNic {
    fn from(w: WireNic) -> Self {
        let info = w.network_info;
        let (subnet, configured, learned) = match info {
            Some(i) => (
                i.subnet.and_then(|s| s.ext_id),
                i.ipv4_config
                    .and_then(|c| c.ip_address)
                    .and_then(|ip| ip.value.parse().ok()),
                i.ipv4_info
                    .map(|i| i.learned_ip_addresses)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|ip| ip.value.parse().ok())
                    .collect(),
            ),
            None => (None, None, Vec::new()),
        };
        Self {
            ext_id: w.ext_id.unwrap_or_default(),
            subnet_ext_id: subnet,
            configured_ip: configured,
            learned_ips: learned,
        }
    }
}

impl From<WireVm> for Vm {
    fn from(w: WireVm) -> Self {
        let power_state = match w.power_state.as_deref() {
            Some("ON") => PowerState::On,
            Some("OFF") => PowerState::Off,
            _ => PowerState::Other,
        };
        let disks = w
            .disks
            .into_iter()
            .map(|d| d.into_vm_disk(BusFamily::Data))
            .chain(
                w.cd_roms
                    .into_iter()
                    .map(|d| d.into_vm_disk(BusFamily::Removable)),
            )
            .collect();
        Self {
            ext_id: w.ext_id,
            name: w.name,
            cluster_ext_id: w.cluster.and_then(|c| c.ext_id),
            power_state,
            disks,
            nics: w.nics.into_iter().map(VmNic::from).collect(),
            has_guest_customization: w.guest_customization.is_some_and(|g| !g.is_null()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOva {
    ext_id: String,
    #[serde(default)]
    name: String,
    create_time: Option<DateTime<Utc>>,
}

impl From<WireOva> for Ova {
    fn from(w: WireOva) -> Self {
        Self {
            ext_id: w.ext_id,
            name: w.name,
            created: w.create_time.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    ext_id: String,
    status: TaskStatus,
    #[serde(default)]
    error_messages: Vec<WireMessage>,
    #[serde(default)]
    completion_details: Vec<WireDetail>,
    #[serde(default)]
    entities_affected: Vec<WireEntity>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct WireDetail {
    name: String,
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntity {
    ext_id: String,
    #[serde(default)]
    rel: String,
}

impl From<WireTask> for Task {
    fn from(w: WireTask) -> Self {
        let error_detail = (!w.error_messages.is_empty()).then(|| {
            w.error_messages
                .into_iter()
                .map(|m| m.message)
                .collect::<Vec<_>>()
                .join("; ")
        });
        Self {
            ext_id: w.ext_id,
            status: w.status,
            error_detail,
            completion_details: w
                .completion_details
                .into_iter()
                .map(|d| CompletionDetail {
                    name: d.name,
                    value: match d.value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    },
                })
                .collect(),
            entities_affected: w
                .entities_affected
                .into_iter()
                .map(|e| EntityReference {
                    ext_id: e.ext_id,
                    rel: e.rel,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

fn image_reference(ext_id: &str) -> Value {
    json!({
        "reference": {
            "$objectType": "vmm.v4.ahv.config.ImageReference",
            "imageExtId": ext_id,
        }
    })
}

fn guest_customization_body(customization: &GuestCustomization) -> Value {
    match customization {
        GuestCustomization::CloudInit { user_data } => json!({
            "config": {
                "$objectType": "vmm.v4.ahv.config.CloudInit",
                "cloudInitScript": {
                    "$objectType": "vmm.v4.ahv.config.Userdata",
                    "value": general_purpose::STANDARD.encode(user_data),
                }
            }
        }),
        GuestCustomization::Sysprep { unattend_xml } => json!({
            "config": {
                "$objectType": "vmm.v4.ahv.config.Sysprep",
                "sysprepScript": {
                    "$objectType": "vmm.v4.ahv.config.Unattendxml",
                    "value": general_purpose::STANDARD.encode(unattend_xml),
                }
            }
        }),
    }
}

fn vm_body(request: &VmCreateRequest) -> Value {
    let mut disks = Vec::new();
    let mut cd_roms = Vec::new();
    for disk in &request.disks {
        let address = json!({ "busType": disk.bus.as_str(), "index": disk.index });
        match disk.role {
            DiskRole::IsoImage => {
                let mut cd_rom = json!({ "diskAddress": address });
                if let Some(image) = &disk.image_ext_id {
                    cd_rom["backingInfo"] = json!({ "dataSource": image_reference(image) });
                }
                cd_roms.push(cd_rom);
            }
            DiskRole::Disk | DiskRole::DiskImage => {
                let mut backing = json!({ "$objectType": "vmm.v4.ahv.config.VmDisk" });
                if let Some(size) = disk.size_bytes {
                    backing["diskSizeBytes"] = json!(size);
                }
                if let Some(image) = &disk.image_ext_id {
                    backing["dataSource"] = image_reference(image);
                }
                disks.push(json!({ "diskAddress": address, "backingInfo": backing }));
            }
        }
    }

    let nics: Vec<Value> = request
        .subnet_ext_ids
        .iter()
        .map(|s| json!({ "networkInfo": { "subnet": { "extId": s } } }))
        .collect();
    let order: Vec<&str> = request.boot.order.iter().map(|d| d.as_str()).collect();
    let boot = if request.boot.firmware.is_uefi() {
        json!({
            "$objectType": "vmm.v4.ahv.config.UefiBoot",
            "isSecureBootEnabled": request.boot.firmware == BootType::SecureBoot,
            "bootOrder": order,
        })
    } else {
        json!({
            "$objectType": "vmm.v4.ahv.config.LegacyBoot",
            "bootOrder": order,
        })
    };
    let gpus: Vec<Value> = request
        .gpus
        .iter()
        .map(|g| {
            json!({
                "name": g.name,
                "mode": g.mode.as_str(),
                "deviceId": g.device_id,
                "vendor": g.vendor.as_str(),
            })
        })
        .collect();
    let serial_ports: Vec<Value> = request
        .serial_ports
        .iter()
        .map(|i| json!({ "index": i, "isConnected": true }))
        .collect();
    let categories: Vec<Value> = request
        .categories
        .iter()
        .map(|c| json!({ "extId": c }))
        .collect();
    let cpu_features: Vec<&str> = if request.hardware_virtualization {
        vec!["HARDWARE_VIRTUALIZATION"]
    } else {
        Vec::new()
    };

    let mut body = json!({
        "name": request.name,
        "description": request.description,
        "cluster": { "extId": request.cluster_ext_id },
        "numSockets": request.num_sockets,
        "numCoresPerSocket": request.cores_per_socket,
        "memorySizeBytes": request.memory_bytes,
        "disks": disks,
        "cdRoms": cd_roms,
        "nics": nics,
        "bootConfig": boot,
        "gpus": gpus,
        "serialPorts": serial_ports,
        "categories": categories,
        "enabledCpuFeatures": cpu_features,
        "vtpmConfig": { "isVtpmEnabled": request.vtpm },
    });
    if let Some(machine) = request.machine_type {
        body["machineType"] = json!(machine.as_str());
    }
    if let Some(customization) = &request.guest_customization {
        body["guestCustomization"] = guest_customization_body(customization);
    }
    if let Some(project) = &request.project_ext_id {
        body["project"] = json!({ "extId": project });
    }
    body
}

fn image_body(request: &ImageCreateRequest) -> Value {
    let mut body = json!({
        "name": request.name,
        "description": request.description,
        "type": request.image_type.as_str(),
        "categoryExtIds": request.categories,
    });
    match &request.source {
        ImageSource::Url(url) => {
            body["source"] = json!({
                "$objectType": "vmm.v4.content.UrlSource",
                "url": url,
                "shouldAllowInsecureUrl": true,
            });
        }
        ImageSource::VmDisk(disk) => {
            body["source"] = json!({
                "$objectType": "vmm.v4.content.VmDiskSource",
                "extId": disk,
            });
        }
        ImageSource::Upload => {}
    }
    if let Some(checksum) = &request.checksum {
        let object_type = match checksum.algorithm {
            ChecksumAlgorithm::Sha1 => "vmm.v4.content.ImageSha1Checksum",
            ChecksumAlgorithm::Sha256 => "vmm.v4.content.ImageSha256Checksum",
        };
        body["checksum"] = json!({ "$objectType": object_type, "hexDigest": checksum.value });
    }
    if let Some(cluster) = &request.cluster_ext_id {
        body["clusterLocationExtIds"] = json!([cluster]);
    }
    body
}

/// Strip the parts of a fetched VM that a PUT must not echo back.
fn apply_vm_update(vm: &mut Value, update: &VmUpdate) {
    if let Some(name) = &update.name {
        vm["name"] = json!(name);
    }
    if let Some(description) = &update.description {
        vm["description"] = json!(description);
    }
    if update.clear_guest_customization {
        if let Some(obj) = vm.as_object_mut() {
            obj.remove("guestCustomization");
        }
    }
}

// ============================================================================
// PrismApi
// ============================================================================

#[async_trait]
impl PrismApi for PrismClient {
    fn authority(&self) -> String {
        self.authority.clone()
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let clusters: Vec<WireCluster> = self
            .list(&format!("{CLUSTERMGMT}/config/clusters"), ResourceKind::Cluster, None)
            .await?;
        Ok(clusters.into_iter().map(Cluster::from).collect())
    }

    async fn get_cluster(&self, ext_id: &str) -> Result<Cluster> {
        let cluster: WireCluster = self
            .get_data(
                &format!("{CLUSTERMGMT}/config/clusters/{ext_id}"),
                ResourceKind::Cluster,
                ext_id,
            )
            .await?;
        Ok(cluster.into())
    }

    async fn list_subnets(&self, name: &str) -> Result<Vec<Subnet>> {
        let subnets: Vec<WireSubnet> = self
            .list(
                &format!("{NETWORKING}/config/subnets"),
                ResourceKind::Subnet,
                Some(eq_filter("name", name)),
            )
            .await?;
        Ok(subnets.into_iter().map(Subnet::from).collect())
    }

    async fn get_subnet(&self, ext_id: &str) -> Result<Subnet> {
        let subnet: WireSubnet = self
            .get_data(
                &format!("{NETWORKING}/config/subnets/{ext_id}"),
                ResourceKind::Subnet,
                ext_id,
            )
            .await?;
        Ok(subnet.into())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let req = self
            .request(Method::POST, &format!("{PROJECTS_V3}/list"))
            .json(&json!({ "kind": "project", "length": 500 }));
        let resp = check(req.send().await?, ResourceKind::Project, "").await?;
        let list: V3List<V3Project> = resp.json().await?;
        Ok(list.entities.into_iter().map(Project::from).collect())
    }

    async fn get_project(&self, ext_id: &str) -> Result<Project> {
        let resp = self
            .request(Method::GET, &format!("{PROJECTS_V3}/{ext_id}"))
            .send()
            .await?;
        let project: V3Project = check(resp, ResourceKind::Project, ext_id)
            .await?
            .json()
            .await?;
        Ok(project.into())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let hosts: Vec<WireHost> = self
            .list(&format!("{CLUSTERMGMT}/config/hosts"), ResourceKind::Host, None)
            .await?;
        Ok(hosts.into_iter().map(Host::from).collect())
    }

    async fn get_host(&self, ext_id: &str) -> Result<Host> {
        let host: WireHost = self
            .get_data(
                &format!("{CLUSTERMGMT}/config/hosts/{ext_id}"),
                ResourceKind::Host,
                ext_id,
            )
            .await?;
        Ok(host.into())
    }

    async fn list_categories(&self, key: &str, value: &str) -> Result<Vec<CategoryEntry>> {
        let filter = format!("{} and {}", eq_filter("key", key), eq_filter("value", value));
        let categories: Vec<WireCategory> = self
            .list(
                &format!("{PRISM}/config/categories"),
                ResourceKind::Category,
                Some(filter),
            )
            .await?;
        Ok(categories
            .into_iter()
            .map(|c| CategoryEntry {
                ext_id: c.ext_id,
                key: c.key,
                value: c.value,
            })
            .collect())
    }

    async fn list_physical_gpus(&self, cluster_ext_id: &str) -> Result<Vec<GpuDevice>> {
        let profiles: Vec<WireGpuProfile> = self
            .list(
                &format!("{CLUSTERMGMT}/config/clusters/{cluster_ext_id}/physical-gpu-profiles"),
                ResourceKind::Gpu,
                None,
            )
            .await?;
        Ok(profiles.into_iter().map(GpuDevice::from).collect())
    }

    async fn list_virtual_gpus(&self, cluster_ext_id: &str) -> Result<Vec<GpuDevice>> {
        let profiles: Vec<WireGpuProfile> = self
            .list(
                &format!("{CLUSTERMGMT}/config/clusters/{cluster_ext_id}/virtual-gpu-profiles"),
                ResourceKind::Gpu,
                None,
            )
            .await?;
        Ok(profiles.into_iter().map(GpuDevice::from).collect())
    }

    async fn list_images(&self, name: &str) -> Result<Vec<Image>> {
        let images: Vec<WireImage> = self
            .list(
                &format!("{VMM}/content/images"),
                ResourceKind::Image,
                Some(eq_filter("name", name)),
            )
            .await?;
        Ok(images.into_iter().map(Image::from).collect())
    }

    async fn get_image(&self, ext_id: &str) -> Result<Image> {
        let image: WireImage = self
            .get_data(&image_path(ext_id), ResourceKind::Image, ext_id)
            .await?;
        Ok(image.into())
    }

    async fn create_image(&self, request: &ImageCreateRequest) -> Result<String> {
        let req = self
            .mutation(Method::POST, &format!("{VMM}/content/images"))
            .json(&image_body(request));
        self.submit(req, ResourceKind::Image, &request.name).await
    }

    async fn upload_image(&self, ext_id: &str, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        tracing::debug!(image = %ext_id, path = %path.display(), bytes = len, "Uploading image file");

        let req = self
            .build(&self.transfer, Method::PUT, &format!("{}/file", image_path(ext_id)))
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, len)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        check(req.send().await?, ResourceKind::Image, ext_id).await?;
        Ok(())
    }

    async fn delete_image(&self, ext_id: &str) -> Result<String> {
        let path = image_path(ext_id);
        let etag = self.etag_of(&path, ResourceKind::Image, ext_id).await?;
        let req = self
            .mutation(Method::DELETE, &path)
            .header(header::IF_MATCH, etag);
        self.submit(req, ResourceKind::Image, ext_id).await
    }

    async fn download_image(&self, ext_id: &str) -> Result<Download> {
        self.download(&format!("{}/file", image_path(ext_id)), ResourceKind::Image, ext_id)
            .await
    }

    async fn create_vm(&self, request: &VmCreateRequest) -> Result<String> {
        let req = self
            .mutation(Method::POST, &format!("{VMM}/ahv/config/vms"))
            .json(&vm_body(request));
        self.submit(req, ResourceKind::Vm, &request.name).await
    }

    async fn get_vm(&self, ext_id: &str) -> Result<Vm> {
        let vm: WireVm = self
            .get_data(&vm_path(ext_id), ResourceKind::Vm, ext_id)
            .await?;
        Ok(vm.into())
    }

    async fn update_vm(&self, ext_id: &str, update: &VmUpdate) -> Result<String> {
        let path = vm_path(ext_id);
        let (mut vm, etag) = self
            .fetch_for_update(&path, ResourceKind::Vm, ext_id)
            .await?;
        apply_vm_update(&mut vm, update);
        let req = self
            .mutation(Method::PUT, &path)
            .header(header::IF_MATCH, etag)
            .json(&vm);
        self.submit(req, ResourceKind::Vm, ext_id).await
    }

    async fn delete_vm(&self, ext_id: &str) -> Result<String> {
        self.vm_action(ext_id, Method::DELETE, &vm_path(ext_id))
            .await
    }

    async fn power_on_vm(&self, ext_id: &str) -> Result<String> {
        let path = format!("{}/$actions/power-on", vm_path(ext_id));
        self.vm_action(ext_id, Method::POST, &path).await
    }

    async fn power_off_vm(&self, ext_id: &str) -> Result<String> {
        let path = format!("{}/$actions/power-off", vm_path(ext_id));
        self.vm_action(ext_id, Method::POST, &path).await
    }

    async fn delete_cd_rom(&self, vm_ext_id: &str, cd_rom_ext_id: &str) -> Result<String> {
        let path = format!("{}/cd-roms/{cd_rom_ext_id}", vm_path(vm_ext_id));
        self.vm_action(vm_ext_id, Method::DELETE, &path).await
    }

    async fn generate_console_token(&self, vm_ext_id: &str) -> Result<String> {
        let path = format!("{}/$actions/generate-console-token", vm_path(vm_ext_id));
        let req = self.mutation(Method::POST, &path).json(&json!({}));
        self.submit(req, ResourceKind::Vm, vm_ext_id).await
    }

    async fn create_template(&self, vm_ext_id: &str, template: &TemplateSpec) -> Result<String> {
        let body = json!({
            "templateName": template.name,
            "templateDescription": template.description.clone().unwrap_or_default(),
            "templateVersionSpec": {
                "versionSource": {
                    "$objectType": "vmm.v4.content.TemplateVmReference",
                    "extId": vm_ext_id,
                }
            }
        });
        let req = self
            .mutation(Method::POST, &format!("{VMM}/content/templates"))
            .json(&body);
        self.submit(req, ResourceKind::Vm, vm_ext_id).await
    }

    async fn export_ova(&self, vm_ext_id: &str, name: &str, format: OvaFormat) -> Result<String> {
        let body = json!({
            "name": name,
            "source": {
                "$objectType": "vmm.v4.content.OvaVmSource",
                "entityExtId": vm_ext_id,
                "diskFileFormat": format.as_str(),
            }
        });
        let req = self
            .mutation(Method::POST, &format!("{VMM}/content/ovas"))
            .json(&body);
        self.submit(req, ResourceKind::Vm, vm_ext_id).await
    }

    async fn list_ovas(&self, name: &str) -> Result<Vec<Ova>> {
        let ovas: Vec<WireOva> = self
            .list(
                &format!("{VMM}/content/ovas"),
                ResourceKind::Ova,
                Some(eq_filter("name", name)),
            )
            .await?;
        Ok(ovas.into_iter().map(Ova::from).collect())
    }

    async fn download_ova(&self, ext_id: &str) -> Result<Download> {
        self.download(&format!("{VMM}/content/ovas/{ext_id}/file"), ResourceKind::Ova, ext_id)
            .await
    }

    async fn get_task(&self, ext_id: &str) -> Result<Task> {
        let task: WireTask = self
            .get_data(&format!("{PRISM}/config/tasks/{ext_id}"), ResourceKind::Task, ext_id)
            .await?;
        Ok(task.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BootConfig, BootDevice, DiskSpec, GpuAssignment, GpuMode, GpuVendor, MachineType};

    fn request() -> VmCreateRequest {
        VmCreateRequest {
            name: "build".into(),
            description: "kiln vm building image out".into(),
            cluster_ext_id: "c-1".into(),
            num_sockets: 2,
            cores_per_socket: 1,
            memory_bytes: 4096 * 1024 * 1024,
            disks: vec![
                DiskSpec {
                    role: DiskRole::DiskImage,
                    bus: BusFamily::Data,
                    index: 0,
                    size_bytes: Some(40 << 30),
                    image_ext_id: Some("img-1".into()),
                },
                DiskSpec {
                    role: DiskRole::IsoImage,
                    bus: BusFamily::Removable,
                    index: 0,
                    size_bytes: None,
                    image_ext_id: Some("iso-1".into()),
                },
            ],
            subnet_ext_ids: vec!["s-1".into()],
            boot: BootConfig {
                firmware: BootType::SecureBoot,
                order: vec![BootDevice::Disk, BootDevice::Cdrom, BootDevice::Network],
            },
            machine_type: Some(MachineType::Q35),
            guest_customization: Some(GuestCustomization::CloudInit {
                user_data: "#cloud-config".into(),
            }),
            serial_ports: vec![0],
            gpus: vec![GpuAssignment {
                name: "A16".into(),
                device_id: Some(7864),
                mode: GpuMode::Virtual,
                vendor: GpuVendor::Nvidia,
            }],
            vtpm: true,
            hardware_virtualization: false,
            categories: vec!["cat-1".into()],
            project_ext_id: None,
        }
    }

    #[test]
    fn test_eq_filter_escapes_quotes() {
        assert_eq!(eq_filter("name", "ubuntu"), "name eq 'ubuntu'");
        assert_eq!(eq_filter("name", "o'brien"), "name eq 'o''brien'");
    }

    #[test]
    fn test_vm_body_splits_disks_and_cd_roms() {
        let body = vm_body(&request());
        assert_eq!(body["disks"].as_array().unwrap().len(), 1);
        assert_eq!(body["cdRoms"].as_array().unwrap().len(), 1);
        assert_eq!(body["disks"][0]["diskAddress"]["busType"], "SCSI");
        assert_eq!(
            body["disks"][0]["backingInfo"]["dataSource"]["reference"]["imageExtId"],
            "img-1"
        );
        assert_eq!(body["cdRoms"][0]["diskAddress"]["busType"], "SATA");
        assert!(body.get("powerState").is_none());
    }

    #[test]
    fn test_vm_body_boot_and_extras() {
        let body = vm_body(&request());
        assert_eq!(body["bootConfig"]["$objectType"], "vmm.v4.ahv.config.UefiBoot");
        assert_eq!(body["bootConfig"]["isSecureBootEnabled"], true);
        assert_eq!(body["bootConfig"]["bootOrder"], json!(["DISK", "CDROM", "NETWORK"]));
        assert_eq!(body["machineType"], "Q35");
        assert_eq!(body["vtpmConfig"]["isVtpmEnabled"], true);
        assert_eq!(body["gpus"][0]["mode"], "VIRTUAL");
        assert_eq!(body["serialPorts"][0]["index"], 0);
        assert!(body.get("project").is_none());

        let encoded = body["guestCustomization"]["config"]["cloudInitScript"]["value"]
            .as_str()
            .unwrap();
        assert_eq!(
            general_purpose::STANDARD.decode(encoded).unwrap(),
            b"#cloud-config"
        );
    }

    #[test]
    fn test_image_body_sources() {
        let mut req = ImageCreateRequest {
            name: "ubuntu.qcow2".into(),
            description: "added by kiln".into(),
            image_type: ImageType::DiskImage,
            source: ImageSource::Url("https://example.com/ubuntu.qcow2".into()),
            checksum: Some(Checksum {
                algorithm: ChecksumAlgorithm::Sha1,
                value: "abc".into(),
            }),
            cluster_ext_id: Some("c-1".into()),
            categories: vec![],
        };
        let body = image_body(&req);
        assert_eq!(body["source"]["url"], "https://example.com/ubuntu.qcow2");
        assert_eq!(body["checksum"]["$objectType"], "vmm.v4.content.ImageSha1Checksum");
        assert_eq!(body["clusterLocationExtIds"], json!(["c-1"]));

        req.source = ImageSource::Upload;
        req.checksum = None;
        let body = image_body(&req);
        assert!(body.get("source").is_none());
        assert!(body.get("checksum").is_none());
    }

    #[test]
    fn test_parse_vm() {
        let raw = json!({
            "extId": "vm-1",
            "name": "build",
            "cluster": { "extId": "c-1" },
            "powerState": "ON",
            "disks": [
                { "extId": "d-1", "diskAddress": { "busType": "SCSI", "index": 0 },
                  "backingInfo": { "diskSizeBytes": 1024 } }
            ],
            "cdRoms": [
                { "extId": "cd-1", "diskAddress": { "busType": "SATA", "index": 0 } }
            ],
            "nics": [
                { "extId": "n-1", "networkInfo": {
                    "subnet": { "extId": "s-1" },
                    "ipv4Config": { "ipAddress": { "value": "10.0.0.9" } },
                    "ipv4Info": { "learnedIpAddresses": [ { "value": "10.0.0.5" } ] }
                } }
            ],
            "guestCustomization": null
        });
        let vm: Vm = serde_json::from_value::<WireVm>(raw).unwrap().into();
        assert_eq!(vm.power_state, PowerState::On);
        assert_eq!(vm.cluster_ext_id.as_deref(), Some("c-1"));
        assert_eq!(vm.disks_on(BusFamily::Data)[0].size_bytes, 1024);
        assert_eq!(vm.disks_on(BusFamily::Removable)[0].ext_id, "cd-1");
        assert_eq!(vm.nics[0].configured_ip, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(vm.nics[0].learned_ips, vec!["10.0.0.5".parse::<std::net::IpAddr>().unwrap()]);
        assert!(!vm.has_guest_customization);
    }

    #[test]
    fn test_parse_task() {
        let raw = json!({
            "extId": "task-1",
            "status": "FAILED",
            "errorMessages": [ { "message": "disk full" } ],
            "completionDetails": [ { "name": "vmConsoleToken", "value": "tok" } ],
            "entitiesAffected": [ { "extId": "vm-1", "rel": "vmm:ahv:config:vm" } ]
        });
        let task: Task = serde_json::from_value::<WireTask>(raw).unwrap().into();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_detail.as_deref(), Some("disk full"));
        assert_eq!(task.completion_details[0].value, "tok");
        assert_eq!(task.entities_affected[0].ext_id, "vm-1");
    }

    #[test]
    fn test_parse_cluster_and_gpu() {
        let cluster: Cluster = serde_json::from_value::<WireCluster>(json!({
            "extId": "c-1", "name": "pe", "config": { "clusterFunction": ["AOS"] }
        }))
        .unwrap()
        .into();
        assert!(cluster.is_aos);

        let pc: Cluster = serde_json::from_value::<WireCluster>(json!({
            "extId": "c-0", "name": "pc", "config": { "clusterFunction": ["PRISM_CENTRAL"] }
        }))
        .unwrap()
        .into();
        assert!(!pc.is_aos);

        let gpu: GpuDevice = serde_json::from_value::<WireGpuProfile>(json!({
            "physicalGpuConfig": { "deviceId": 5, "deviceName": "A16", "type": "PASSTHROUGH_GRAPHICS" },
            "allocatedVmExtIds": ["vm-9"]
        }))
        .unwrap()
        .into();
        assert_eq!(gpu.device_id, Some(5));
        assert!(gpu.in_use);
    }

    #[test]
    fn test_apply_vm_update_clears_customization() {
        let mut vm = json!({ "name": "a", "guestCustomization": { "config": {} } });
        apply_vm_update(
            &mut vm,
            &VmUpdate {
                name: Some("b".into()),
                description: None,
                clear_guest_customization: true,
            },
        );
        assert_eq!(vm["name"], "b");
        assert!(vm.get("guestCustomization").is_none());
    }

    #[test]
    fn test_client_rejects_incomplete_endpoint() {
        let endpoint = PrismEndpoint::new("pc.local", "admin", "");
        assert!(matches!(
            PrismClient::new(&endpoint),
            Err(PrismError::InvalidConfig(_))
        ));
    }
}
