//! The resource driver façade used by the build pipeline.

use crate::api::PrismApi;
use crate::builder::VmSpecBuilder;
use crate::config::{DiskConfig, VmConfig};
use crate::error::{PrismError, ResourceKind, Result};
use crate::image::{DiskExportOptions, ImageLifecycle, ReadinessPolicy};
use crate::ip::{IpAcquisition, IpWaitConfig};
use crate::resolver::Resolver;
use crate::task::{cancellable, cancellable_sleep, TaskWaiter};
use crate::types::{
    BusFamily, Cluster, ConsoleAccess, Download, Image, ImageType, OvaFormat, PreparedVm,
    TaskCompletion, TemplateSpec, Vm, VmCreateRequest, VmUpdate,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Completion detail carrying the console token.
const CONSOLE_TOKEN_DETAIL: &str = "vmConsoleToken";
/// Completion detail carrying the console websocket path.
const CONSOLE_URI_DETAIL: &str = "websocketUri";

/// Operations the build pipeline needs from the virtualization control plane.
///
/// Every call takes the build's cancellation token; long waits return
/// [`PrismError::Cancelled`] promptly once it fires.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Resolve a VM description into a create request.
    async fn create_request(&self, config: &VmConfig, cancel: &CancellationToken) -> Result<PreparedVm>;

    /// Create a VM and return it as observed after the task completes.
    async fn create(&self, request: &VmCreateRequest, cancel: &CancellationToken) -> Result<Vm>;

    async fn power_on(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn power_off(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn delete(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn get_vm(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<Vm>;
    async fn update(&self, vm_ext_id: &str, update: &VmUpdate, cancel: &CancellationToken) -> Result<()>;

    /// Detach every CD-ROM, one task per device. Returns how many were removed.
    async fn clean_removable_media(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<usize>;

    async fn create_image_url(
        &self,
        disk: &DiskConfig,
        config: &VmConfig,
        cancel: &CancellationToken,
    ) -> Result<Image>;
    async fn create_image_file(
        &self,
        path: &Path,
        image_type: ImageType,
        config: &VmConfig,
        cancel: &CancellationToken,
    ) -> Result<Image>;
    async fn create_image_from_disk(
        &self,
        disk_ext_id: &str,
        index: usize,
        options: &DiskExportOptions,
        cancel: &CancellationToken,
    ) -> Result<Image>;
    async fn get_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<Image>;
    async fn delete_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<()>;

    /// Package a powered-off VM as an OVA.
    async fn create_ova(
        &self,
        vm_ext_id: &str,
        name: &str,
        format: OvaFormat,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Stream the newest OVA called `name`.
    async fn export_ova(&self, name: &str, cancel: &CancellationToken) -> Result<Download>;

    /// Stream an image's content.
    async fn export_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<Download>;

    /// Create a template from a VM and return its id.
    async fn create_template(
        &self,
        vm_ext_id: &str,
        template: &TemplateSpec,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn generate_console_access(
        &self,
        vm_ext_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ConsoleAccess>;

    /// Wait for a stable address and return it unbracketed.
    async fn wait_for_ip(
        &self,
        vm_ext_id: &str,
        config: &IpWaitConfig,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// [`Driver`] over the Prism Central v4 API.
#[derive(Clone)]
pub struct PrismDriver {
    api: Arc<dyn PrismApi>,
    waiter: TaskWaiter,
    readiness: ReadinessPolicy,
    ova_lookup: ReadinessPolicy,
}

impl PrismDriver {
    pub fn new(api: Arc<dyn PrismApi>) -> Self {
        Self {
            api,
            waiter: TaskWaiter::default(),
            readiness: ReadinessPolicy::default(),
            ova_lookup: ReadinessPolicy::default(),
        }
    }

    /// Task poll interval and budget.
    pub fn with_waiter(mut self, waiter: TaskWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Wait for created images to report a size.
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Wait for exported OVAs to become listable.
    pub fn with_ova_lookup(mut self, ova_lookup: ReadinessPolicy) -> Self {
        self.ova_lookup = ova_lookup;
        self
    }

    pub fn waiter(&self) -> &TaskWaiter {
        &self.waiter
    }

    fn images<'a>(&'a self, cancel: &'a CancellationToken) -> ImageLifecycle<'a> {
        ImageLifecycle::new(self.api.as_ref(), &self.waiter, cancel).with_readiness(self.readiness)
    }

    async fn run_task(&self, task: &str, cancel: &CancellationToken) -> Result<TaskCompletion> {
        self.waiter.wait(self.api.as_ref(), task, cancel).await
    }

    async fn cluster_of(&self, config: &VmConfig) -> Result<Cluster> {
        Resolver::new(self.api.as_ref())
            .cluster(config.cluster_name.as_deref(), config.cluster_uuid.as_deref())
            .await
    }
}

#[async_trait]
impl Driver for PrismDriver {
    async fn create_request(&self, config: &VmConfig, cancel: &CancellationToken) -> Result<PreparedVm> {
        VmSpecBuilder::new(self.api.as_ref(), &self.waiter, cancel)
            .build(config)
            .await
    }

    async fn create(&self, request: &VmCreateRequest, cancel: &CancellationToken) -> Result<Vm> {
        let task = cancellable(cancel, self.api.create_vm(request)).await?;
        tracing::info!(vm = %request.name, task = %task, "VM creation submitted");

        let completion = self.run_task(&task, cancel).await?;
        let ext_id = completion.entity("vm").ok_or_else(|| {
            PrismError::InvalidResponse(format!("task {task} did not report the created VM"))
        })?;
        let vm = cancellable(cancel, self.api.get_vm(ext_id)).await?;
        tracing::info!(vm = %vm.ext_id, name = %vm.name, "VM created");
        Ok(vm)
    }

    async fn power_on(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = cancellable(cancel, self.api.power_on_vm(vm_ext_id)).await?;
        self.run_task(&task, cancel).await?;
        tracing::info!(vm = %vm_ext_id, "VM powered on");
        Ok(())
    }

    async fn power_off(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = cancellable(cancel, self.api.power_off_vm(vm_ext_id)).await?;
        self.run_task(&task, cancel).await?;
        tracing::info!(vm = %vm_ext_id, "VM powered off");
        Ok(())
    }

    async fn delete(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<()> {
        let task = cancellable(cancel, self.api.delete_vm(vm_ext_id)).await?;
        self.run_task(&task, cancel).await?;
        tracing::info!(vm = %vm_ext_id, "VM deleted");
        Ok(())
    }

    async fn get_vm(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<Vm> {
        cancellable(cancel, self.api.get_vm(vm_ext_id)).await
    }

    async fn update(&self, vm_ext_id: &str, update: &VmUpdate, cancel: &CancellationToken) -> Result<()> {
        let task = cancellable(cancel, self.api.update_vm(vm_ext_id, update)).await?;
        self.run_task(&task, cancel).await?;
        tracing::debug!(vm = %vm_ext_id, "VM updated");
        Ok(())
    }

    async fn clean_removable_media(&self, vm_ext_id: &str, cancel: &CancellationToken) -> Result<usize> {
        let vm = self.get_vm(vm_ext_id, cancel).await?;
        let cd_roms: Vec<String> = vm
            .disks_on(BusFamily::Removable)
            .into_iter()
            .map(|d| d.ext_id.clone())
            .collect();

        // The provider rejects changing several devices in one update.
        for cd_rom in &cd_roms {
            let task = cancellable(cancel, self.api.delete_cd_rom(vm_ext_id, cd_rom)).await?;
            self.run_task(&task, cancel).await?;
            tracing::debug!(vm = %vm_ext_id, cd_rom = %cd_rom, "CD-ROM removed");
        }
        Ok(cd_roms.len())
    }

    async fn create_image_url(
        &self,
        disk: &DiskConfig,
        config: &VmConfig,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        let cluster = self.cluster_of(config).await?;
        self.images(cancel).create_from_url(disk, &cluster).await
    }

    async fn create_image_file(
        &self,
        path: &Path,
        image_type: ImageType,
        config: &VmConfig,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        let cluster = self.cluster_of(config).await?;
        self.images(cancel)
            .create_from_file(path, image_type, &cluster)
            .await
    }

    async fn create_image_from_disk(
        &self,
        disk_ext_id: &str,
        index: usize,
        options: &DiskExportOptions,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        self.images(cancel)
            .create_from_vm_disk(disk_ext_id, index, options)
            .await
    }

    async fn get_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<Image> {
        cancellable(cancel, self.api.get_image(ext_id)).await
    }

    async fn delete_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.images(cancel).delete(ext_id).await
    }

    async fn create_ova(
        &self,
        vm_ext_id: &str,
        name: &str,
        format: OvaFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task = cancellable(cancel, self.api.export_ova(vm_ext_id, name, format)).await?;
        tracing::info!(vm = %vm_ext_id, ova = %name, format = format.as_str(), "OVA export submitted");
        self.run_task(&task, cancel).await?;
        Ok(())
    }

    async fn export_ova(&self, name: &str, cancel: &CancellationToken) -> Result<Download> {
        let mut attempt = 0;
        let ova = loop {
            attempt += 1;
            let newest = cancellable(cancel, self.api.list_ovas(name))
                .await?
                .into_iter()
                .filter(|o| o.name == name)
                .max_by_key(|o| o.created);
            if let Some(ova) = newest {
                break ova;
            }
            if attempt >= self.ova_lookup.attempts {
                return Err(PrismError::not_found(ResourceKind::Ova, name));
            }
            tracing::debug!(ova = %name, attempt, "OVA not listed yet");
            cancellable_sleep(cancel, self.ova_lookup.interval).await?;
        };

        tracing::info!(ova = %ova.ext_id, name = %name, "Downloading OVA");
        cancellable(cancel, self.api.download_ova(&ova.ext_id)).await
    }

    async fn export_image(&self, ext_id: &str, cancel: &CancellationToken) -> Result<Download> {
        tracing::info!(image = %ext_id, "Downloading image");
        cancellable(cancel, self.api.download_image(ext_id)).await
    }

    async fn create_template(
        &self,
        vm_ext_id: &str,
        template: &TemplateSpec,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let task = cancellable(cancel, self.api.create_template(vm_ext_id, template)).await?;
        let completion = self.run_task(&task, cancel).await?;
        let ext_id = completion.entity("template").ok_or_else(|| {
            PrismError::InvalidResponse(format!("task {task} did not report the created template"))
        })?;
        tracing::info!(vm = %vm_ext_id, template = %ext_id, name = %template.name, "Template created");
        Ok(ext_id.to_string())
    }

    async fn generate_console_access(
        &self,
        vm_ext_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ConsoleAccess> {
        let task = cancellable(cancel, self.api.generate_console_token(vm_ext_id)).await?;
        let completion = self.run_task(&task, cancel).await?;

        let missing = |field: &str| {
            PrismError::InvalidResponse(format!("console task {task} did not return {field}"))
        };
        let token = completion
            .detail(CONSOLE_TOKEN_DETAIL)
            .ok_or_else(|| missing(CONSOLE_TOKEN_DETAIL))?
            .to_string();
        let ws_uri = completion
            .detail(CONSOLE_URI_DETAIL)
            .ok_or_else(|| missing(CONSOLE_URI_DETAIL))?
            .to_string();

        let mut url = reqwest::Url::parse(&format!("wss://{}{}", self.api.authority(), ws_uri))
            .map_err(|e| PrismError::InvalidResponse(format!("invalid console uri '{ws_uri}': {e}")))?;
        url.query_pairs_mut().append_pair("VmConsoleToken", &token);

        tracing::debug!(vm = %vm_ext_id, uri = %ws_uri, "Console access generated");
        Ok(ConsoleAccess {
            token,
            ws_uri,
            url: url.to_string(),
        })
    }

    async fn wait_for_ip(
        &self,
        vm_ext_id: &str,
        config: &IpWaitConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        IpAcquisition::new(self.api.as_ref(), config, cancel)
            .acquire(vm_ext_id)
            .await
    }
}
