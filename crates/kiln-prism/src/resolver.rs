//! Name/UUID to unique resource resolution.
//!
//! Every lookup follows the same rule: an explicit id is fetched directly,
//! otherwise all resources whose name matches case-insensitively are listed,
//! kind-specific filters are applied, and exactly one survivor is required.

use crate::api::PrismApi;
use crate::config::Category;
use crate::error::{PrismError, ResourceKind, Result};
use crate::types::{
    CategoryEntry, Cluster, GpuAssignment, GpuDevice, GpuMode, GpuVendor, Host, Image, Project,
    Subnet, SubnetType,
};

/// Require exactly one match.
pub(crate) fn exactly_one<T>(
    kind: ResourceKind,
    name: &str,
    mut found: Vec<T>,
    hint: &'static str,
) -> Result<T> {
    match found.len() {
        0 => Err(PrismError::not_found(kind, name)),
        1 => Ok(found.remove(0)),
        count => Err(PrismError::Ambiguous {
            kind,
            name: name.to_string(),
            count,
            hint,
        }),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolves human-supplied names to unique resources.
pub struct Resolver<'a> {
    api: &'a dyn PrismApi,
}

impl<'a> Resolver<'a> {
    pub fn new(api: &'a dyn PrismApi) -> Self {
        Self { api }
    }

    /// Resolve a Prism Element cluster.
    pub async fn cluster(&self, name: Option<&str>, id: Option<&str>) -> Result<Cluster> {
        if let Some(id) = non_empty(id) {
            return self.api.get_cluster(id).await;
        }
        let name = non_empty(name).ok_or_else(|| {
            PrismError::InvalidConfig("cluster name or uuid must be provided".into())
        })?;

        let found: Vec<_> = self
            .api
            .list_clusters()
            .await?
            .into_iter()
            .filter(|c| c.name.eq_ignore_ascii_case(name) && c.is_aos)
            .collect();
        exactly_one(ResourceKind::Cluster, name, found, "cluster_uuid")
    }

    /// Resolve a subnet usable from `cluster_ext_id`.
    ///
    /// Overlay subnets are cluster-independent and always eligible.
    pub async fn subnet(
        &self,
        name: Option<&str>,
        id: Option<&str>,
        cluster_ext_id: &str,
    ) -> Result<Subnet> {
        if let Some(id) = non_empty(id) {
            return self.api.get_subnet(id).await;
        }
        let name = non_empty(name).ok_or_else(|| {
            PrismError::InvalidConfig("subnet name or uuid must be provided".into())
        })?;

        let found: Vec<_> = self
            .api
            .list_subnets(name)
            .await?
            .into_iter()
            .filter(|s| s.name.eq_ignore_ascii_case(name))
            .filter(|s| s.subnet_type == SubnetType::Overlay || s.belongs_to(cluster_ext_id))
            .collect();
        exactly_one(ResourceKind::Subnet, name, found, "subnet_uuid")
    }

    pub async fn project(&self, name: Option<&str>, id: Option<&str>) -> Result<Project> {
        if let Some(id) = non_empty(id) {
            return self.api.get_project(id).await;
        }
        let name = non_empty(name).ok_or_else(|| {
            PrismError::InvalidConfig("project name or uuid must be provided".into())
        })?;

        let found: Vec<_> = self
            .api
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| p.name.eq_ignore_ascii_case(name))
            .collect();
        exactly_one(ResourceKind::Project, name, found, "project_uuid")
    }

    pub async fn host(&self, name: Option<&str>, id: Option<&str>) -> Result<Host> {
        if let Some(id) = non_empty(id) {
            return self.api.get_host(id).await;
        }
        let name = non_empty(name)
            .ok_or_else(|| PrismError::InvalidConfig("host name or uuid must be provided".into()))?;

        let found: Vec<_> = self
            .api
            .list_hosts()
            .await?
            .into_iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .collect();
        exactly_one(ResourceKind::Host, name, found, "host_uuid")
    }

    /// Resolve a category by exact key and value.
    pub async fn category(&self, category: &Category) -> Result<CategoryEntry> {
        let found: Vec<_> = self
            .api
            .list_categories(&category.key, &category.value)
            .await?
            .into_iter()
            .filter(|c| c.key == category.key && c.value == category.value)
            .collect();
        exactly_one(
            ResourceKind::Category,
            &category.to_string(),
            found,
            "a unique key/value pair",
        )
    }

    /// Resolve every category to its ext id, failing on the first miss.
    pub async fn categories(&self, categories: &[Category]) -> Result<Vec<String>> {
        let mut ext_ids = Vec::with_capacity(categories.len());
        for category in categories {
            ext_ids.push(self.category(category).await?.ext_id);
        }
        Ok(ext_ids)
    }

    /// Resolve an image by id or name.
    pub async fn image(&self, name: Option<&str>, id: Option<&str>) -> Result<Image> {
        if let Some(id) = non_empty(id) {
            return self.api.get_image(id).await;
        }
        let name = non_empty(name).ok_or_else(|| {
            PrismError::InvalidConfig("source image name or uuid must be provided".into())
        })?;

        let found: Vec<_> = self
            .api
            .list_images(name)
            .await?
            .into_iter()
            .filter(|i| i.name.eq_ignore_ascii_case(name))
            .collect();
        exactly_one(ResourceKind::Image, name, found, "source_image_uuid")
    }

    /// Resolve a GPU on `cluster_ext_id`.
    ///
    /// Unused physical GPUs are preferred; the virtual pool is consulted only
    /// when no physical GPU matches. Identical cards collapse into a single
    /// profile, so several free cards of one model resolve to the first; two
    /// different profiles sharing a name are ambiguous unless `device_id`
    /// selects one.
    pub async fn gpu(
        &self,
        name: &str,
        device_id: Option<i64>,
        cluster_ext_id: &str,
    ) -> Result<GpuAssignment> {
        let physical = self.api.list_physical_gpus(cluster_ext_id).await?;
        let candidates = gpu_profiles(&physical, name, device_id, |gpu| {
            let graphics = gpu
                .gpu_type
                .as_deref()
                .is_some_and(|t| t.to_ascii_uppercase().contains("GRAPHICS"));
            if graphics {
                GpuMode::PassthroughGraphics
            } else {
                GpuMode::PassthroughCompute
            }
        });
        if !candidates.is_empty() {
            return exactly_one(ResourceKind::Gpu, name, candidates, "gpu device_id");
        }

        let virtual_gpus = self.api.list_virtual_gpus(cluster_ext_id).await?;
        let candidates = gpu_profiles(&virtual_gpus, name, device_id, |_| GpuMode::Virtual);
        exactly_one(ResourceKind::Gpu, name, candidates, "gpu device_id")
    }
}

/// Distinct unused profiles matching `name`, in pool order.
fn gpu_profiles(
    pool: &[GpuDevice],
    name: &str,
    device_id: Option<i64>,
    mode: impl Fn(&GpuDevice) -> GpuMode,
) -> Vec<GpuAssignment> {
    let mut profiles: Vec<GpuAssignment> = Vec::new();
    for gpu in pool {
        if gpu.in_use || !gpu.device_name.eq_ignore_ascii_case(name) {
            continue;
        }
        if device_id.is_some() && gpu.device_id != device_id {
            continue;
        }
        let assignment = GpuAssignment {
            name: gpu.device_name.clone(),
            device_id: gpu.device_id,
            mode: mode(gpu),
            vendor: gpu
                .vendor_name
                .as_deref()
                .map(GpuVendor::from_vendor_name)
                .unwrap_or(GpuVendor::Unknown),
        };
        let duplicate = profiles
            .iter()
            .any(|p| p.device_id == assignment.device_id && p.mode == assignment.mode);
        if !duplicate {
            profiles.push(assignment);
        }
    }
    profiles
}
