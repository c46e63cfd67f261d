//! Image lifecycle: creation from URL, local file or VM disk, with reuse
//! and dedup rules, readiness polling and deletion.

use crate::api::PrismApi;
use crate::config::{Category, DiskConfig};
use crate::error::{PrismError, ResourceKind, Result};
use crate::resolver::Resolver;
use crate::task::{cancellable, cancellable_sleep, TaskWaiter};
use crate::types::{Cluster, Image, ImageCreateRequest, ImageSource, ImageType};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Description attached to images created for source media.
pub const SOURCE_IMAGE_DESCRIPTION: &str = "added by kiln";

/// Bounded wait for a freshly created image to report a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(5),
        }
    }
}

/// What to do when an image with the export name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Create alongside existing images.
    #[default]
    Keep,
    /// Delete a single existing image first; several are left alone.
    ForceDeregister,
    /// Refuse to create if any image has the name.
    FailIfImageExists,
}

/// Parameters for saving a VM disk as an image.
#[derive(Debug, Clone, Default)]
pub struct DiskExportOptions {
    pub base_name: String,
    pub description: String,
    pub categories: Vec<Category>,
    pub policy: DedupPolicy,
}

/// Image name for the disk at `index`; disks after the first get a suffix.
pub fn export_image_name(base: &str, index: usize) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{base}-disk{}", index + 1)
    }
}

/// Last path segment of a URL, without query or fragment.
pub fn image_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

pub struct ImageLifecycle<'a> {
    api: &'a dyn PrismApi,
    waiter: &'a TaskWaiter,
    cancel: &'a CancellationToken,
    readiness: ReadinessPolicy,
}

impl<'a> ImageLifecycle<'a> {
    pub fn new(api: &'a dyn PrismApi, waiter: &'a TaskWaiter, cancel: &'a CancellationToken) -> Self {
        Self {
            api,
            waiter,
            cancel,
            readiness: ReadinessPolicy::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Find a reusable image for `disk`'s URL or create one on `cluster`.
    ///
    /// Candidates must share the exact name, be ready, and match the declared
    /// checksum when one is given. A candidate that also carries the same
    /// source URL beats name-only matches. With `source_image_force` the
    /// reusable image is deleted and a fresh one created.
    pub async fn create_from_url(&self, disk: &DiskConfig, cluster: &Cluster) -> Result<Image> {
        let url = disk
            .source_image_uri
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| PrismError::InvalidConfig("source_image_uri is required".into()))?;
        let name = image_name_from_url(url).ok_or_else(|| {
            PrismError::InvalidConfig(format!("cannot derive an image name from '{url}'"))
        })?;
        let name = name.as_str();
        let image_type = disk.image_type.image_type().ok_or_else(|| {
            PrismError::InvalidConfig(format!("{} disks cannot be sourced from a URL", disk.image_type))
        })?;
        let checksum = disk.checksum();

        let mut usable = Vec::new();
        for image in cancellable(self.cancel, self.api.list_images(name)).await? {
            if image.name != name {
                continue;
            }
            if !image.is_ready() {
                tracing::debug!(image = %image.ext_id, "Skipping image that is not ready");
                continue;
            }
            if let Some(wanted) = &checksum {
                let matches = image.checksum.as_ref().is_some_and(|c| c.matches(wanted));
                if !matches {
                    tracing::warn!(
                        image = %image.ext_id,
                        name = %name,
                        "Checksum mismatch, skipping candidate image"
                    );
                    continue;
                }
            }
            usable.push(image);
        }

        let (exact, name_only): (Vec<_>, Vec<_>) = usable
            .into_iter()
            .partition(|i| i.source_url.as_deref() == Some(url));
        let candidates = if exact.is_empty() { name_only } else { exact };
        if candidates.len() > 1 {
            return Err(PrismError::Ambiguous {
                kind: ResourceKind::Image,
                name: name.to_string(),
                count: candidates.len(),
                hint: "source_image_uuid",
            });
        }

        if let Some(existing) = candidates.into_iter().next() {
            if !disk.source_image_force {
                tracing::info!(image = %existing.ext_id, name = %name, "Reusing existing image");
                return Ok(existing);
            }
            tracing::info!(image = %existing.ext_id, name = %name, "Force recreating image");
            self.delete(&existing.ext_id).await?;
        }

        let request = ImageCreateRequest {
            name: name.to_string(),
            description: SOURCE_IMAGE_DESCRIPTION.to_string(),
            image_type,
            source: ImageSource::Url(url.to_string()),
            checksum,
            cluster_ext_id: Some(cluster.ext_id.clone()),
            categories: Vec::new(),
        };
        let ext_id = self.submit(&request).await?;
        tracing::info!(image = %ext_id, name = %name, url = %url, "Image created from URL");
        self.wait_ready(&ext_id).await
    }

    /// Upload a local file as a new image, then resolve it by name.
    pub async fn create_from_file(
        &self,
        path: &Path,
        image_type: ImageType,
        cluster: &Cluster,
    ) -> Result<Image> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PrismError::InvalidConfig(format!("invalid image file path {}", path.display()))
            })?
            .to_string();

        let request = ImageCreateRequest {
            name: name.clone(),
            description: SOURCE_IMAGE_DESCRIPTION.to_string(),
            image_type,
            source: ImageSource::Upload,
            checksum: None,
            cluster_ext_id: Some(cluster.ext_id.clone()),
            categories: Vec::new(),
        };
        let ext_id = self.submit(&request).await?;

        tracing::info!(image = %ext_id, path = %path.display(), "Uploading image file");
        cancellable(self.cancel, self.api.upload_image(&ext_id, path)).await?;

        Resolver::new(self.api).image(Some(&name), None).await
    }

    /// Save a VM disk as a new image, applying the dedup policy first.
    pub async fn create_from_vm_disk(
        &self,
        disk_ext_id: &str,
        index: usize,
        options: &DiskExportOptions,
    ) -> Result<Image> {
        let name = export_image_name(&options.base_name, index);

        if options.policy != DedupPolicy::Keep {
            let existing: Vec<_> = cancellable(self.cancel, self.api.list_images(&name))
                .await?
                .into_iter()
                .filter(|i| i.name == name)
                .collect();

            match (existing.len(), options.policy) {
                (0, _) => {}
                (count, DedupPolicy::FailIfImageExists) => {
                    return Err(PrismError::ImageExists { name, count });
                }
                (1, _) => {
                    tracing::info!(image = %existing[0].ext_id, name = %name, "Deleting existing image");
                    self.delete(&existing[0].ext_id).await?;
                }
                (count, _) => {
                    tracing::warn!(name = %name, count, "Several images share the name, not deleting any");
                }
            }
        }

        let categories = Resolver::new(self.api)
            .categories(&options.categories)
            .await?;

        let request = ImageCreateRequest {
            name: name.clone(),
            description: options.description.clone(),
            image_type: ImageType::DiskImage,
            source: ImageSource::VmDisk(disk_ext_id.to_string()),
            checksum: None,
            cluster_ext_id: None,
            categories,
        };
        let ext_id = self.submit(&request).await?;
        tracing::info!(image = %ext_id, name = %name, disk = %disk_ext_id, "Image created from VM disk");
        cancellable(self.cancel, self.api.get_image(&ext_id)).await
    }

    /// Delete an image and wait for the task.
    pub async fn delete(&self, ext_id: &str) -> Result<()> {
        let task = cancellable(self.cancel, self.api.delete_image(ext_id)).await?;
        self.waiter.wait(self.api, &task, self.cancel).await?;
        tracing::info!(image = %ext_id, "Image deleted");
        Ok(())
    }

    async fn submit(&self, request: &ImageCreateRequest) -> Result<String> {
        let task = cancellable(self.cancel, self.api.create_image(request)).await?;
        let completion = self.waiter.wait(self.api, &task, self.cancel).await?;
        completion
            .entity("image")
            .map(str::to_string)
            .ok_or_else(|| {
                PrismError::InvalidResponse(format!("task {task} did not report the created image"))
            })
    }

    /// Poll until the image has a size, returning it as-is when the
    /// attempts run out.
    async fn wait_ready(&self, ext_id: &str) -> Result<Image> {
        let mut image = cancellable(self.cancel, self.api.get_image(ext_id)).await?;
        for _ in 1..self.readiness.attempts {
            if image.is_ready() {
                return Ok(image);
            }
            cancellable_sleep(self.cancel, self.readiness.interval).await?;
            image = cancellable(self.cancel, self.api.get_image(ext_id)).await?;
        }
        if !image.is_ready() {
            tracing::warn!(image = %ext_id, "Image still has no size, continuing anyway");
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePrism;
    use crate::types::{Checksum, ChecksumAlgorithm, DiskRole};
    use tokio::time::Instant;

    const URL: &str = "https://mirror.example/images/jammy.qcow2?sig=1";

    fn cluster() -> Cluster {
        Cluster {
            ext_id: "c-1".into(),
            name: "pe".into(),
            is_aos: true,
        }
    }

    fn url_disk(force: bool) -> DiskConfig {
        DiskConfig {
            source_image_uri: Some(URL.into()),
            source_image_force: force,
            ..DiskConfig::new(DiskRole::DiskImage)
        }
    }

    fn waiter() -> TaskWaiter {
        TaskWaiter::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn test_export_image_name() {
        assert_eq!(export_image_name("golden", 0), "golden");
        assert_eq!(export_image_name("golden", 1), "golden-disk2");
        assert_eq!(export_image_name("golden", 2), "golden-disk3");
    }

    #[test]
    fn test_image_name_from_url() {
        assert_eq!(image_name_from_url(URL).as_deref(), Some("jammy.qcow2"));
        assert_eq!(image_name_from_url("http://host/a/b.iso#frag").as_deref(), Some("b.iso"));
        assert_eq!(image_name_from_url("http://host/"), None);
        assert_eq!(image_name_from_url("not a url"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_url_reuses_image() {
        let fake = FakePrism::new();
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let images = ImageLifecycle::new(&fake, &waiter, &cancel);

        let first = images.create_from_url(&url_disk(false), &cluster()).await.unwrap();
        let second = images.create_from_url(&url_disk(false), &cluster()).await.unwrap();

        assert_eq!(first.ext_id, second.ext_id);
        assert_eq!(first.name, "jammy.qcow2");
        assert_eq!(fake.calls("create_image"), 1);
        assert_eq!(fake.calls("delete_image"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_url_force_recreates() {
        let fake = FakePrism::new();
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let images = ImageLifecycle::new(&fake, &waiter, &cancel);

        let first = images.create_from_url(&url_disk(false), &cluster()).await.unwrap();
        let second = images.create_from_url(&url_disk(true), &cluster()).await.unwrap();

        assert_ne!(first.ext_id, second.ext_id);
        assert_eq!(fake.deleted_images(), vec![first.ext_id.clone()]);
        assert!(fake.image(&first.ext_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_url_skips_checksum_mismatch() {
        let fake = FakePrism::new();
        let stale = fake.add_image("jammy.qcow2", ImageType::DiskImage, Some(URL), 4096);
        fake.set_image_checksum(
            &stale,
            Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                value: "00ff".into(),
            },
        );
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let images = ImageLifecycle::new(&fake, &waiter, &cancel);

        let disk = DiskConfig {
            source_image_checksum: Some("ABCD".into()),
            ..url_disk(false)
        };
        let created = images.create_from_url(&disk, &cluster()).await.unwrap();

        assert_ne!(created.ext_id, stale);
        let stored = fake.image(&created.ext_id).unwrap();
        assert_eq!(stored.checksum.unwrap().value, "ABCD");
        assert_eq!(fake.calls("delete_image"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_url_prefers_exact_url() {
        let fake = FakePrism::new();
        fake.add_image("jammy.qcow2", ImageType::DiskImage, Some("http://other/jammy.qcow2"), 10);
        let exact = fake.add_image("jammy.qcow2", ImageType::DiskImage, Some(URL), 10);
        let waiter = waiter();
        let cancel = CancellationToken::new();

        let found = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_url(&url_disk(false), &cluster())
            .await
            .unwrap();

        assert_eq!(found.ext_id, exact);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_url_ambiguous_name_only() {
        let fake = FakePrism::new();
        fake.add_image("jammy.qcow2", ImageType::DiskImage, None, 10);
        fake.add_image("jammy.qcow2", ImageType::DiskImage, None, 10);
        let waiter = waiter();
        let cancel = CancellationToken::new();

        let err = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_url(&url_disk(false), &cluster())
            .await
            .unwrap_err();

        assert!(matches!(err, PrismError::Ambiguous { kind: ResourceKind::Image, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_budget_exhausted_is_not_fatal() {
        let fake = FakePrism::new();
        fake.set_new_image_size(0);
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let image = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_url(&url_disk(false), &cluster())
            .await
            .unwrap();

        assert!(!image.is_ready());
        // One task poll plus eleven readiness intervals.
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_from_file_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.iso");
        std::fs::write(&path, b"iso-bytes").unwrap();

        let fake = FakePrism::new();
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let image = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_file(&path, ImageType::IsoImage, &cluster())
            .await
            .unwrap();

        assert_eq!(image.name, "seed.iso");
        assert_eq!(image.image_type, ImageType::IsoImage);
        assert_eq!(image.size_bytes, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_with_force_deregister_replaces_image() {
        let fake = FakePrism::new();
        let old = fake.add_image("img1", ImageType::DiskImage, None, 10);
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let options = DiskExportOptions {
            base_name: "img1".into(),
            description: "built by kiln".into(),
            categories: vec![],
            policy: DedupPolicy::ForceDeregister,
        };

        let image = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_vm_disk("disk-1", 0, &options)
            .await
            .unwrap();

        assert_ne!(image.ext_id, old);
        assert_eq!(
            fake.call_log(),
            vec!["list_images", "delete_image", "create_image", "get_image"]
        );
        assert_eq!(fake.deleted_images(), vec![old]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_fail_if_exists() {
        let fake = FakePrism::new();
        fake.add_image("img1", ImageType::DiskImage, None, 10);
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let options = DiskExportOptions {
            base_name: "img1".into(),
            policy: DedupPolicy::FailIfImageExists,
            ..Default::default()
        };

        let err = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_vm_disk("disk-1", 0, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, PrismError::ImageExists { count: 1, .. }));
        assert_eq!(fake.calls("create_image"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_force_deregister_skips_several() {
        let fake = FakePrism::new();
        fake.add_image("img1-disk2", ImageType::DiskImage, None, 10);
        fake.add_image("img1-disk2", ImageType::DiskImage, None, 10);
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let options = DiskExportOptions {
            base_name: "img1".into(),
            policy: DedupPolicy::ForceDeregister,
            ..Default::default()
        };

        let image = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_vm_disk("disk-2", 1, &options)
            .await
            .unwrap();

        assert_eq!(image.name, "img1-disk2");
        assert_eq!(fake.calls("delete_image"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_unresolvable_category_is_fatal() {
        let fake = FakePrism::new();
        let waiter = waiter();
        let cancel = CancellationToken::new();
        let options = DiskExportOptions {
            base_name: "img1".into(),
            categories: vec![Category {
                key: "env".into(),
                value: "prod".into(),
            }],
            ..Default::default()
        };

        let err = ImageLifecycle::new(&fake, &waiter, &cancel)
            .create_from_vm_disk("disk-1", 0, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, PrismError::NotFound { kind: ResourceKind::Category, .. }));
    }
}
