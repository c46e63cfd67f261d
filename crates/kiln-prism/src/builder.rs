//! Translation of a [`VmConfig`] into a provider create request.

use crate::api::PrismApi;
use crate::config::{DiskConfig, OsType, VmConfig};
use crate::error::{PrismError, Result};
use crate::image::ImageLifecycle;
use crate::resolver::Resolver;
use crate::task::TaskWaiter;
use crate::types::{
    BootConfig, BootDevice, BootPriority, BootType, BusFamily, Cluster, DiskRole, DiskSpec,
    GuestCustomization, Image, MachineType, PreparedVm, VmCreateRequest,
};
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Bus family and index for each disk, in configuration order.
///
/// Each family has its own index sequence starting at 0, so interleaving
/// CD-ROMs between data disks does not shift data disk indices.
pub fn allocate_disks(roles: &[DiskRole]) -> Vec<(BusFamily, u32)> {
    let mut data = 0;
    let mut removable = 0;
    roles
        .iter()
        .map(|role| {
            let bus = role.bus();
            let counter = match bus {
                BusFamily::Data => &mut data,
                BusFamily::Removable => &mut removable,
            };
            let index = *counter;
            *counter += 1;
            (bus, index)
        })
        .collect()
}

/// Boot device order for a priority and number of CD-ROMs.
pub fn boot_order(priority: BootPriority, cdrom_count: usize) -> Vec<BootDevice> {
    if cdrom_count == 0 {
        if priority == BootPriority::Cdrom {
            tracing::warn!("Boot priority is cdrom but no CD-ROM is configured, booting from disk");
        }
        return vec![BootDevice::Disk, BootDevice::Network];
    }
    match priority {
        BootPriority::Cdrom => vec![BootDevice::Cdrom, BootDevice::Disk, BootDevice::Network],
        BootPriority::Disk => vec![BootDevice::Disk, BootDevice::Cdrom, BootDevice::Network],
    }
}

/// Machine chipset required by a firmware type.
pub fn machine_type(firmware: BootType) -> Option<MachineType> {
    match firmware {
        BootType::SecureBoot => Some(MachineType::Q35),
        BootType::Legacy | BootType::Uefi => None,
    }
}

/// Guest customization for the OS family, if user data is set.
pub fn guest_customization(config: &VmConfig) -> Option<GuestCustomization> {
    let user_data = config.user_data.as_deref().filter(|d| !d.is_empty())?;
    Some(match config.os_type {
        OsType::Linux => GuestCustomization::CloudInit {
            user_data: user_data.to_string(),
        },
        OsType::Windows => GuestCustomization::Sysprep {
            unattend_xml: user_data.to_string(),
        },
    })
}

/// Resolves every reference in a [`VmConfig`] and assembles the create request.
pub struct VmSpecBuilder<'a> {
    api: &'a dyn PrismApi,
    waiter: &'a TaskWaiter,
    cancel: &'a CancellationToken,
}

impl<'a> VmSpecBuilder<'a> {
    pub fn new(api: &'a dyn PrismApi, waiter: &'a TaskWaiter, cancel: &'a CancellationToken) -> Self {
        Self {
            api,
            waiter,
            cancel,
        }
    }

    pub async fn build(&self, config: &VmConfig) -> Result<PreparedVm> {
        let resolver = Resolver::new(self.api);
        let cluster = resolver
            .cluster(config.cluster_name.as_deref(), config.cluster_uuid.as_deref())
            .await?;
        tracing::debug!(cluster = %cluster.ext_id, vm = %config.vm_name, "Preparing VM request");

        let roles: Vec<_> = config.disks.iter().map(|d| d.image_type).collect();
        let slots = allocate_disks(&roles);

        let mut disks = Vec::with_capacity(config.disks.len());
        let mut images_to_delete = Vec::new();
        for (position, (disk, (bus, index))) in config.disks.iter().zip(slots).enumerate() {
            let spec = match disk.image_type {
                DiskRole::Disk => DiskSpec {
                    role: disk.image_type,
                    bus,
                    index,
                    size_bytes: disk.disk_size_gb.map(|gb| gb * GIB),
                    image_ext_id: None,
                },
                DiskRole::DiskImage | DiskRole::IsoImage => {
                    let image = self.source_image(position, disk, &cluster).await?;
                    if disk.source_image_delete {
                        images_to_delete.push(image.ext_id.clone());
                    }
                    let size_bytes = match (disk.disk_size_gb, disk.image_type) {
                        (Some(gb), _) => Some(gb * GIB),
                        (None, DiskRole::DiskImage) => Some(image.size_bytes),
                        (None, _) => None,
                    };
                    DiskSpec {
                        role: disk.image_type,
                        bus,
                        index,
                        size_bytes,
                        image_ext_id: Some(image.ext_id),
                    }
                }
            };
            disks.push(spec);
        }

        let mut subnet_ext_ids = Vec::with_capacity(config.nics.len());
        for nic in &config.nics {
            let subnet = resolver
                .subnet(
                    nic.subnet_name.as_deref(),
                    nic.subnet_uuid.as_deref(),
                    &cluster.ext_id,
                )
                .await?;
            subnet_ext_ids.push(subnet.ext_id);
        }

        let mut gpus = Vec::with_capacity(config.gpus.len());
        for gpu in &config.gpus {
            gpus.push(resolver.gpu(&gpu.name, gpu.device_id, &cluster.ext_id).await?);
        }

        let categories = resolver.categories(&config.categories).await?;

        let project_ext_id = match config.project.as_deref().filter(|p| !p.is_empty()) {
            Some(name) => Some(resolver.project(Some(name), None).await?.ext_id),
            None => None,
        };

        let cdrom_count = roles.iter().filter(|r| **r == DiskRole::IsoImage).count();
        let request = VmCreateRequest {
            name: config.vm_name.clone(),
            description: format!("kiln vm building image {}", config.image_name),
            cluster_ext_id: cluster.ext_id,
            num_sockets: config.cpu,
            cores_per_socket: config.core,
            memory_bytes: config.memory_mb * MIB,
            disks,
            subnet_ext_ids,
            boot: BootConfig {
                firmware: config.boot_type,
                order: boot_order(config.boot_priority, cdrom_count),
            },
            machine_type: machine_type(config.boot_type),
            guest_customization: guest_customization(config),
            serial_ports: if config.serial_port { vec![0] } else { Vec::new() },
            gpus,
            vtpm: config.vtpm,
            hardware_virtualization: config.hardware_virtualization,
            categories,
            project_ext_id,
        };

        Ok(PreparedVm {
            request,
            images_to_delete,
        })
    }

    /// Source image of an image-backed disk: by UUID, then name, then URL.
    async fn source_image(
        &self,
        position: usize,
        disk: &DiskConfig,
        cluster: &Cluster,
    ) -> Result<Image> {
        let resolver = Resolver::new(self.api);
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());

        if present(&disk.source_image_uuid) {
            resolver.image(None, disk.source_image_uuid.as_deref()).await
        } else if present(&disk.source_image_name) {
            resolver.image(disk.source_image_name.as_deref(), None).await
        } else if present(&disk.source_image_uri) {
            ImageLifecycle::new(self.api, self.waiter, self.cancel)
                .create_from_url(disk, cluster)
                .await
        } else {
            Err(PrismError::InvalidConfig(format!(
                "vm_disks {}: {} requires a source image",
                position + 1,
                disk.image_type
            )))
        }
    }
}
