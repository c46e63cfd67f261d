//! Raw control-plane operations.
//!
//! [`PrismApi`] is the seam between the driver logic (resolution, image
//! lifecycle, task polling) and the transport. [`PrismClient`](crate::PrismClient)
//! implements it over HTTPS; the `fake` feature provides an in-memory
//! implementation for tests.
//!
//! Every mutating call returns the id of the task that carries it out.

use crate::error::Result;
use crate::types::{
    CategoryEntry, Cluster, Download, GpuDevice, Host, Image, ImageCreateRequest, Ova, OvaFormat,
    Project, Subnet, Task, TemplateSpec, Vm, VmCreateRequest, VmUpdate,
};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait PrismApi: Send + Sync {
    /// `host:port` of the control plane.
    fn authority(&self) -> String;

    // Clusters, networks, projects, hosts, categories

    async fn list_clusters(&self) -> Result<Vec<Cluster>>;
    async fn get_cluster(&self, ext_id: &str) -> Result<Cluster>;
    async fn list_subnets(&self, name: &str) -> Result<Vec<Subnet>>;
    async fn get_subnet(&self, ext_id: &str) -> Result<Subnet>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn get_project(&self, ext_id: &str) -> Result<Project>;
    async fn list_hosts(&self) -> Result<Vec<Host>>;
    async fn get_host(&self, ext_id: &str) -> Result<Host>;
    async fn list_categories(&self, key: &str, value: &str) -> Result<Vec<CategoryEntry>>;
    async fn list_physical_gpus(&self, cluster_ext_id: &str) -> Result<Vec<GpuDevice>>;
    async fn list_virtual_gpus(&self, cluster_ext_id: &str) -> Result<Vec<GpuDevice>>;

    // Images

    async fn list_images(&self, name: &str) -> Result<Vec<Image>>;
    async fn get_image(&self, ext_id: &str) -> Result<Image>;
    async fn create_image(&self, request: &ImageCreateRequest) -> Result<String>;
    async fn upload_image(&self, ext_id: &str, path: &Path) -> Result<()>;
    async fn delete_image(&self, ext_id: &str) -> Result<String>;
    async fn download_image(&self, ext_id: &str) -> Result<Download>;

    // Virtual machines

    async fn create_vm(&self, request: &VmCreateRequest) -> Result<String>;
    async fn get_vm(&self, ext_id: &str) -> Result<Vm>;
    async fn update_vm(&self, ext_id: &str, update: &VmUpdate) -> Result<String>;
    async fn delete_vm(&self, ext_id: &str) -> Result<String>;
    async fn power_on_vm(&self, ext_id: &str) -> Result<String>;
    async fn power_off_vm(&self, ext_id: &str) -> Result<String>;
    async fn delete_cd_rom(&self, vm_ext_id: &str, cd_rom_ext_id: &str) -> Result<String>;
    async fn generate_console_token(&self, vm_ext_id: &str) -> Result<String>;

    // Templates and OVAs

    async fn create_template(&self, vm_ext_id: &str, template: &TemplateSpec) -> Result<String>;
    async fn export_ova(&self, vm_ext_id: &str, name: &str, format: OvaFormat) -> Result<String>;
    async fn list_ovas(&self, name: &str) -> Result<Vec<Ova>>;
    async fn download_ova(&self, ext_id: &str) -> Result<Download>;

    // Tasks

    async fn get_task(&self, ext_id: &str) -> Result<Task>;
}
