//! In-memory control plane.
//!
//! [`FakePrism`] implements [`PrismApi`] against plain collections so the
//! driver logic (resolution, image reuse, task polling, IP settling) runs
//! unchanged in tests. Mutations take effect when submitted and produce a
//! task that succeeds on its first poll unless a test scripts otherwise.
//!
//! Enabled for this crate's own tests and, for dependents, by the `fake`
//! feature.

use crate::api::PrismApi;
use crate::error::{PrismError, ResourceKind, Result};
use crate::types::{
    BusFamily, CategoryEntry, Checksum, Cluster, CompletionDetail, Download, EntityReference,
    GpuDevice, Host, Image, ImageCreateRequest, ImageSource, ImageType, Ova, OvaFormat, PowerState,
    Project, Subnet, Task, TaskStatus, TemplateSpec, Vm, VmCreateRequest, VmDisk, VmNic, VmUpdate,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::time::Instant;

const FAKE_AUTHORITY: &str = "prism.fake:9440";
const DEFAULT_IMAGE_SIZE: u64 = 4096;

#[derive(Debug, Default)]
struct FakeTask {
    statuses: VecDeque<TaskStatus>,
    error: Option<String>,
    details: Vec<CompletionDetail>,
    entities: Vec<EntityReference>,
    fetches: usize,
}

struct AddressScript {
    start: Instant,
    steps: Vec<(Duration, IpAddr)>,
}

#[derive(Default)]
struct State {
    next_id: u64,

    clusters: Vec<Cluster>,
    subnets: Vec<Subnet>,
    projects: Vec<Project>,
    hosts: Vec<Host>,
    categories: Vec<CategoryEntry>,
    physical_gpus: Vec<GpuDevice>,
    virtual_gpus: Vec<GpuDevice>,

    images: Vec<Image>,
    image_content: HashMap<String, Bytes>,
    new_image_size: Option<u64>,
    truncated_downloads: HashMap<String, usize>,
    stalled_downloads: HashSet<String>,
    // Held so stalled readers never see EOF.
    stall_writers: Vec<DuplexStream>,

    vms: Vec<Vm>,
    vm_requests: Vec<VmCreateRequest>,
    addresses: HashMap<String, AddressScript>,

    ovas: Vec<Ova>,
    ova_content: HashMap<String, Bytes>,
    templates: Vec<(String, String, TemplateSpec)>,

    tasks: HashMap<String, FakeTask>,
    task_failures: HashMap<String, String>,
    api_failures: HashSet<String>,

    calls: Vec<String>,
    deleted_images: Vec<String>,
    deleted_vms: Vec<String>,
    downloaded_ovas: Vec<String>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    /// Record a call and apply an injected transport failure.
    fn enter(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        if self.api_failures.contains(op) {
            return Err(PrismError::Api {
                status: 500,
                body: format!("injected failure in {op}"),
            });
        }
        Ok(())
    }

    /// Task that fails instead of applying `op`, if one was requested.
    fn failed_task(&mut self, op: &str) -> Option<String> {
        let detail = self.task_failures.remove(op)?;
        let id = self.id("task");
        self.tasks.insert(
            id.clone(),
            FakeTask {
                statuses: VecDeque::from([TaskStatus::Running, TaskStatus::Failed]),
                error: Some(detail),
                ..Default::default()
            },
        );
        Some(id)
    }

    fn task(&mut self, entities: Vec<EntityReference>, details: Vec<CompletionDetail>) -> String {
        let id = self.id("task");
        self.tasks.insert(
            id.clone(),
            FakeTask {
                statuses: VecDeque::from([TaskStatus::Succeeded]),
                details,
                entities,
                ..Default::default()
            },
        );
        id
    }

    fn vm_mut(&mut self, ext_id: &str) -> Result<&mut Vm> {
        self.vms
            .iter_mut()
            .find(|vm| vm.ext_id == ext_id)
            .ok_or_else(|| PrismError::not_found(ResourceKind::Vm, ext_id))
    }
}

fn entity(rel: &str, ext_id: &str) -> Vec<EntityReference> {
    vec![EntityReference {
        ext_id: ext_id.to_string(),
        rel: rel.to_string(),
    }]
}

fn find<T: Clone>(items: &[T], kind: ResourceKind, ext_id: &str, id: impl Fn(&T) -> &str) -> Result<T> {
    items
        .iter()
        .find(|item| id(item) == ext_id)
        .cloned()
        .ok_or_else(|| PrismError::not_found(kind, ext_id))
}

/// In-memory [`PrismApi`].
#[derive(Default)]
pub struct FakePrism {
    state: Mutex<State>,
}

impl FakePrism {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn add_cluster(&self, cluster: Cluster) {
        self.lock().clusters.push(cluster);
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.lock().subnets.push(subnet);
    }

    pub fn add_project(&self, project: Project) {
        self.lock().projects.push(project);
    }

    pub fn add_host(&self, host: Host) {
        self.lock().hosts.push(host);
    }

    pub fn add_category(&self, ext_id: &str, key: &str, value: &str) {
        self.lock().categories.push(CategoryEntry {
            ext_id: ext_id.into(),
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn add_physical_gpu(&self, gpu: GpuDevice) {
        self.lock().physical_gpus.push(gpu);
    }

    pub fn add_virtual_gpu(&self, gpu: GpuDevice) {
        self.lock().virtual_gpus.push(gpu);
    }

    /// Add an image and return its id.
    pub fn add_image(
        &self,
        name: &str,
        image_type: ImageType,
        source_url: Option<&str>,
        size_bytes: u64,
    ) -> String {
        let mut state = self.lock();
        let ext_id = state.id("img");
        state.images.push(Image {
            ext_id: ext_id.clone(),
            name: name.into(),
            image_type,
            source_url: source_url.map(str::to_string),
            checksum: None,
            size_bytes,
            categories: Vec::new(),
        });
        ext_id
    }

    pub fn set_image_checksum(&self, ext_id: &str, checksum: Checksum) {
        let mut state = self.lock();
        if let Some(image) = state.images.iter_mut().find(|i| i.ext_id == ext_id) {
            image.checksum = Some(checksum);
        }
    }

    /// Size reported by images created from a URL (0 = never ready).
    pub fn set_new_image_size(&self, size: u64) {
        self.lock().new_image_size = Some(size);
    }

    pub fn add_vm(&self, vm: Vm) {
        self.lock().vms.push(vm);
    }

    pub fn set_power_state(&self, vm_ext_id: &str, power_state: PowerState) {
        if let Ok(vm) = self.lock().vm_mut(vm_ext_id) {
            vm.power_state = power_state;
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Statuses returned by successive polls of `task_id`; the last repeats.
    pub fn script_task(&self, task_id: &str, statuses: Vec<TaskStatus>) {
        let mut state = self.lock();
        let task = state.tasks.entry(task_id.to_string()).or_default();
        task.statuses = statuses.into();
    }

    pub fn set_task_error(&self, task_id: &str, detail: &str) {
        let mut state = self.lock();
        state.tasks.entry(task_id.to_string()).or_default().error = Some(detail.to_string());
    }

    /// The next task submitted by `op` ends FAILED with `detail` and has no effect.
    pub fn fail_task(&self, op: &str, detail: &str) {
        self.lock()
            .task_failures
            .insert(op.to_string(), detail.to_string());
    }

    /// Every call to `op` fails with an HTTP 500.
    pub fn fail_call(&self, op: &str) {
        self.lock().api_failures.insert(op.to_string());
    }

    /// Addresses reported by `vm_ext_id`, each visible from its offset
    /// (relative to now) until the next one. Creates the VM if missing.
    pub fn script_addresses(&self, vm_ext_id: &str, steps: Vec<(Duration, IpAddr)>) {
        let mut state = self.lock();
        if state.vm_mut(vm_ext_id).is_err() {
            state.vms.push(Vm {
                ext_id: vm_ext_id.to_string(),
                name: vm_ext_id.to_string(),
                cluster_ext_id: None,
                power_state: PowerState::On,
                disks: Vec::new(),
                nics: Vec::new(),
                has_guest_customization: false,
            });
        }
        state.addresses.insert(
            vm_ext_id.to_string(),
            AddressScript {
                start: Instant::now(),
                steps,
            },
        );
    }

    /// Serve only the first `len` bytes of the image while reporting its full size.
    pub fn truncate_download(&self, ext_id: &str, len: usize) {
        self.lock()
            .truncated_downloads
            .insert(ext_id.to_string(), len);
    }

    /// Downloads of `ext_id` deliver half the content and then never finish.
    pub fn stall_download(&self, ext_id: &str) {
        self.lock().stalled_downloads.insert(ext_id.to_string());
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Number of calls to `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == op).count()
    }

    /// All calls in order, excluding task polls.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn task_fetches(&self, task_id: &str) -> usize {
        self.lock().tasks.get(task_id).map_or(0, |t| t.fetches)
    }

    pub fn image(&self, ext_id: &str) -> Option<Image> {
        self.lock().images.iter().find(|i| i.ext_id == ext_id).cloned()
    }

    pub fn images(&self) -> Vec<Image> {
        self.lock().images.clone()
    }

    pub fn deleted_images(&self) -> Vec<String> {
        self.lock().deleted_images.clone()
    }

    pub fn vm(&self, ext_id: &str) -> Option<Vm> {
        self.lock().vms.iter().find(|vm| vm.ext_id == ext_id).cloned()
    }

    pub fn vms(&self) -> Vec<Vm> {
        self.lock().vms.clone()
    }

    pub fn deleted_vms(&self) -> Vec<String> {
        self.lock().deleted_vms.clone()
    }

    /// Create requests in submission order.
    pub fn vm_requests(&self) -> Vec<VmCreateRequest> {
        self.lock().vm_requests.clone()
    }

    pub fn ovas(&self) -> Vec<Ova> {
        self.lock().ovas.clone()
    }

    pub fn downloaded_ovas(&self) -> Vec<String> {
        self.lock().downloaded_ovas.clone()
    }

    /// Templates as `(template id, source vm id, spec)`.
    pub fn templates(&self) -> Vec<(String, String, TemplateSpec)> {
        self.lock().templates.clone()
    }
}

#[async_trait]
impl PrismApi for FakePrism {
    fn authority(&self) -> String {
        FAKE_AUTHORITY.to_string()
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut state = self.lock();
        state.enter("list_clusters")?;
        Ok(state.clusters.clone())
    }

    async fn get_cluster(&self, ext_id: &str) -> Result<Cluster> {
        let mut state = self.lock();
        state.enter("get_cluster")?;
        find(&state.clusters, ResourceKind::Cluster, ext_id, |c| c.ext_id.as_str())
    }

    async fn list_subnets(&self, name: &str) -> Result<Vec<Subnet>> {
        let mut state = self.lock();
        state.enter("list_subnets")?;
        Ok(state
            .subnets
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn get_subnet(&self, ext_id: &str) -> Result<Subnet> {
        let mut state = self.lock();
        state.enter("get_subnet")?;
        find(&state.subnets, ResourceKind::Subnet, ext_id, |s| s.ext_id.as_str())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut state = self.lock();
        state.enter("list_projects")?;
        Ok(state.projects.clone())
    }

    async fn get_project(&self, ext_id: &str) -> Result<Project> {
        let mut state = self.lock();
        state.enter("get_project")?;
        find(&state.projects, ResourceKind::Project, ext_id, |p| p.ext_id.as_str())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let mut state = self.lock();
        state.enter("list_hosts")?;
        Ok(state.hosts.clone())
    }

    async fn get_host(&self, ext_id: &str) -> Result<Host> {
        let mut state = self.lock();
        state.enter("get_host")?;
        find(&state.hosts, ResourceKind::Host, ext_id, |h| h.ext_id.as_str())
    }

    async fn list_categories(&self, key: &str, _value: &str) -> Result<Vec<CategoryEntry>> {
        let mut state = self.lock();
        state.enter("list_categories")?;
        Ok(state
            .categories
            .iter()
            .filter(|c| c.key == key)
            .cloned()
            .collect())
    }

    async fn list_physical_gpus(&self, _cluster_ext_id: &str) -> Result<Vec<GpuDevice>> {
        let mut state = self.lock();
        state.enter("list_physical_gpus")?;
        Ok(state.physical_gpus.clone())
    }

    async fn list_virtual_gpus(&self, _cluster_ext_id: &str) -> Result<Vec<GpuDevice>> {
        let mut state = self.lock();
        state.enter("list_virtual_gpus")?;
        Ok(state.virtual_gpus.clone())
    }

    async fn list_images(&self, name: &str) -> Result<Vec<Image>> {
        let mut state = self.lock();
        state.enter("list_images")?;
        Ok(state
            .images
            .iter()
            .filter(|i| i.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn get_image(&self, ext_id: &str) -> Result<Image> {
        let mut state = self.lock();
        state.enter("get_image")?;
        find(&state.images, ResourceKind::Image, ext_id, |i| i.ext_id.as_str())
    }

    async fn create_image(&self, request: &ImageCreateRequest) -> Result<String> {
        let mut state = self.lock();
        state.enter("create_image")?;
        if let Some(task) = state.failed_task("create_image") {
            return Ok(task);
        }

        let default_size = state.new_image_size.unwrap_or(DEFAULT_IMAGE_SIZE);
        let (source_url, size_bytes) = match &request.source {
            ImageSource::Url(url) => (Some(url.clone()), default_size),
            ImageSource::Upload => (None, 0),
            ImageSource::VmDisk(disk) => {
                let size = state
                    .vms
                    .iter()
                    .flat_map(|vm| vm.disks.iter())
                    .find(|d| &d.ext_id == disk)
                    .map_or(default_size, |d| d.size_bytes);
                (None, size)
            }
        };

        let ext_id = state.id("img");
        state.images.push(Image {
            ext_id: ext_id.clone(),
            name: request.name.clone(),
            image_type: request.image_type,
            source_url,
            checksum: request.checksum.clone(),
            size_bytes,
            categories: request.categories.clone(),
        });
        Ok(state.task(entity("vmm:content:image", &ext_id), Vec::new()))
    }

    async fn upload_image(&self, ext_id: &str, path: &Path) -> Result<()> {
        let content = Bytes::from(tokio::fs::read(path).await?);
        let mut state = self.lock();
        state.enter("upload_image")?;
        let image = state
            .images
            .iter_mut()
            .find(|i| i.ext_id == ext_id)
            .ok_or_else(|| PrismError::not_found(ResourceKind::Image, ext_id))?;
        image.size_bytes = content.len() as u64;
        state.image_content.insert(ext_id.to_string(), content);
        Ok(())
    }

    async fn delete_image(&self, ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("delete_image")?;
        if let Some(task) = state.failed_task("delete_image") {
            return Ok(task);
        }
        let before = state.images.len();
        state.images.retain(|i| i.ext_id != ext_id);
        if state.images.len() == before {
            return Err(PrismError::not_found(ResourceKind::Image, ext_id));
        }
        state.deleted_images.push(ext_id.to_string());
        Ok(state.task(entity("vmm:content:image", ext_id), Vec::new()))
    }

    async fn download_image(&self, ext_id: &str) -> Result<Download> {
        let mut state = self.lock();
        state.enter("download_image")?;
        let image = find(&state.images, ResourceKind::Image, ext_id, |i| i.ext_id.as_str())?;
        let mut content = state
            .image_content
            .get(ext_id)
            .cloned()
            .unwrap_or_else(|| Bytes::from(vec![0xAB; image.size_bytes as usize]));
        if let Some(len) = state.truncated_downloads.get(ext_id) {
            content.truncate(*len);
        }

        let reader: Box<dyn tokio::io::AsyncRead + Send + Unpin> =
            if state.stalled_downloads.contains(ext_id) {
                let half = content.slice(..content.len() / 2);
                let (writer, pending) = tokio::io::duplex(64);
                state.stall_writers.push(writer);
                Box::new(Cursor::new(half).chain(pending))
            } else {
                Box::new(Cursor::new(content))
            };
        Ok(Download {
            reader,
            size: Some(image.size_bytes),
        })
    }

    async fn create_vm(&self, request: &VmCreateRequest) -> Result<String> {
        let mut state = self.lock();
        state.enter("create_vm")?;
        state.vm_requests.push(request.clone());
        if let Some(task) = state.failed_task("create_vm") {
            return Ok(task);
        }

        let mut disks = Vec::with_capacity(request.disks.len());
        for spec in &request.disks {
            let image_size = spec
                .image_ext_id
                .as_ref()
                .and_then(|id| state.images.iter().find(|i| &i.ext_id == id))
                .map_or(0, |i| i.size_bytes);
            let prefix = match spec.bus {
                BusFamily::Data => "disk",
                BusFamily::Removable => "cdrom",
            };
            disks.push(VmDisk {
                ext_id: state.id(prefix),
                bus: spec.bus,
                index: spec.index,
                size_bytes: spec.size_bytes.unwrap_or(image_size),
            });
        }
        let mut nics = Vec::with_capacity(request.subnet_ext_ids.len());
        for subnet in &request.subnet_ext_ids {
            nics.push(VmNic {
                ext_id: state.id("nic"),
                subnet_ext_id: Some(subnet.clone()),
                ..Default::default()
            });
        }

        let ext_id = state.id("vm");
        state.vms.push(Vm {
            ext_id: ext_id.clone(),
            name: request.name.clone(),
            cluster_ext_id: Some(request.cluster_ext_id.clone()),
            power_state: PowerState::Off,
            disks,
            nics,
            has_guest_customization: request.guest_customization.is_some(),
        });
        Ok(state.task(entity("vmm:ahv:config:vm", &ext_id), Vec::new()))
    }

    async fn get_vm(&self, ext_id: &str) -> Result<Vm> {
        let mut state = self.lock();
        state.enter("get_vm")?;
        let mut vm = find(&state.vms, ResourceKind::Vm, ext_id, |vm| vm.ext_id.as_str())?;

        if let Some(script) = state.addresses.get(ext_id) {
            let elapsed = script.start.elapsed();
            let current = script
                .steps
                .iter()
                .filter(|(offset, _)| *offset <= elapsed)
                .last()
                .map(|(_, ip)| *ip);
            if let Some(ip) = current {
                if vm.nics.is_empty() {
                    vm.nics.push(VmNic::default());
                }
                vm.nics[0].learned_ips = vec![ip];
            }
        }
        Ok(vm)
    }

    async fn update_vm(&self, ext_id: &str, update: &VmUpdate) -> Result<String> {
        let mut state = self.lock();
        state.enter("update_vm")?;
        if let Some(task) = state.failed_task("update_vm") {
            return Ok(task);
        }
        let vm = state.vm_mut(ext_id)?;
        if let Some(name) = &update.name {
            vm.name = name.clone();
        }
        if update.clear_guest_customization {
            vm.has_guest_customization = false;
        }
        Ok(state.task(entity("vmm:ahv:config:vm", ext_id), Vec::new()))
    }

    async fn delete_vm(&self, ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("delete_vm")?;
        if let Some(task) = state.failed_task("delete_vm") {
            return Ok(task);
        }
        state.vm_mut(ext_id)?;
        state.vms.retain(|vm| vm.ext_id != ext_id);
        state.deleted_vms.push(ext_id.to_string());
        Ok(state.task(entity("vmm:ahv:config:vm", ext_id), Vec::new()))
    }

    async fn power_on_vm(&self, ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("power_on_vm")?;
        if let Some(task) = state.failed_task("power_on_vm") {
            return Ok(task);
        }
        state.vm_mut(ext_id)?.power_state = PowerState::On;
        Ok(state.task(entity("vmm:ahv:config:vm", ext_id), Vec::new()))
    }

    async fn power_off_vm(&self, ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("power_off_vm")?;
        if let Some(task) = state.failed_task("power_off_vm") {
            return Ok(task);
        }
        state.vm_mut(ext_id)?.power_state = PowerState::Off;
        Ok(state.task(entity("vmm:ahv:config:vm", ext_id), Vec::new()))
    }

    async fn delete_cd_rom(&self, vm_ext_id: &str, cd_rom_ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("delete_cd_rom")?;
        if let Some(task) = state.failed_task("delete_cd_rom") {
            return Ok(task);
        }
        let vm = state.vm_mut(vm_ext_id)?;
        let before = vm.disks.len();
        vm.disks
            .retain(|d| !(d.bus == BusFamily::Removable && d.ext_id == cd_rom_ext_id));
        if vm.disks.len() == before {
            return Err(PrismError::not_found(ResourceKind::Vm, cd_rom_ext_id));
        }
        Ok(state.task(entity("vmm:ahv:config:vm", vm_ext_id), Vec::new()))
    }

    async fn generate_console_token(&self, vm_ext_id: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("generate_console_token")?;
        if let Some(task) = state.failed_task("generate_console_token") {
            return Ok(task);
        }
        state.vm_mut(vm_ext_id)?;
        let token = state.id("token");
        let details = vec![
            CompletionDetail {
                name: "vmConsoleToken".into(),
                value: token,
            },
            CompletionDetail {
                name: "websocketUri".into(),
                value: format!("/vnc/vm/{vm_ext_id}/proxy"),
            },
        ];
        Ok(state.task(Vec::new(), details))
    }

    async fn create_template(&self, vm_ext_id: &str, template: &TemplateSpec) -> Result<String> {
        let mut state = self.lock();
        state.enter("create_template")?;
        if let Some(task) = state.failed_task("create_template") {
            return Ok(task);
        }
        state.vm_mut(vm_ext_id)?;
        let ext_id = state.id("tmpl");
        state
            .templates
            .push((ext_id.clone(), vm_ext_id.to_string(), template.clone()));
        Ok(state.task(entity("vmm:content:template", &ext_id), Vec::new()))
    }

    async fn export_ova(&self, vm_ext_id: &str, name: &str, format: OvaFormat) -> Result<String> {
        let mut state = self.lock();
        state.enter("export_ova")?;
        if let Some(task) = state.failed_task("export_ova") {
            return Ok(task);
        }
        state.vm_mut(vm_ext_id)?;
        let ext_id = state.id("ova");
        let created = DateTime::<Utc>::from_timestamp(1_700_000_000 + state.next_id as i64, 0)
            .unwrap_or_default();
        state.ovas.push(Ova {
            ext_id: ext_id.clone(),
            name: name.to_string(),
            created,
        });
        let content = Bytes::from(format!("ova {name} {} {vm_ext_id}", format.as_str()));
        state.ova_content.insert(ext_id.clone(), content);
        Ok(state.task(entity("vmm:content:ova", &ext_id), Vec::new()))
    }

    async fn list_ovas(&self, name: &str) -> Result<Vec<Ova>> {
        let mut state = self.lock();
        state.enter("list_ovas")?;
        Ok(state.ovas.iter().filter(|o| o.name == name).cloned().collect())
    }

    async fn download_ova(&self, ext_id: &str) -> Result<Download> {
        let mut state = self.lock();
        state.enter("download_ova")?;
        let content = state
            .ova_content
            .get(ext_id)
            .cloned()
            .ok_or_else(|| PrismError::not_found(ResourceKind::Ova, ext_id))?;
        state.downloaded_ovas.push(ext_id.to_string());
        Ok(Download {
            size: Some(content.len() as u64),
            reader: Box::new(Cursor::new(content)),
        })
    }

    async fn get_task(&self, ext_id: &str) -> Result<Task> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(ext_id)
            .ok_or_else(|| PrismError::not_found(ResourceKind::Task, ext_id))?;
        task.fetches += 1;

        let status = if task.statuses.len() > 1 {
            task.statuses.pop_front()
        } else {
            task.statuses.front().copied()
        }
        .unwrap_or(TaskStatus::Succeeded);

        Ok(Task {
            ext_id: ext_id.to_string(),
            status,
            error_detail: task.error.clone(),
            completion_details: task.details.clone(),
            entities_affected: task.entities.clone(),
        })
    }
}
