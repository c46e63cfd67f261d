//! Domain types shared by the driver, the wire client and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tokio::io::AsyncRead;

// ============================================================================
// Disks and boot
// ============================================================================

/// Role a configured disk plays in the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskRole {
    /// Empty data disk of a declared size.
    Disk,
    /// Data disk cloned from a source image.
    DiskImage,
    /// CD-ROM backed by an ISO image.
    IsoImage,
}

impl DiskRole {
    /// Bus family the role is attached to.
    pub fn bus(self) -> BusFamily {
        match self {
            Self::Disk | Self::DiskImage => BusFamily::Data,
            Self::IsoImage => BusFamily::Removable,
        }
    }

    /// Image type used when this role is backed by an image.
    pub fn image_type(self) -> Option<ImageType> {
        match self {
            Self::Disk => None,
            Self::DiskImage => Some(ImageType::DiskImage),
            Self::IsoImage => Some(ImageType::IsoImage),
        }
    }
}

impl fmt::Display for DiskRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => write!(f, "DISK"),
            Self::DiskImage => write!(f, "DISK_IMAGE"),
            Self::IsoImage => write!(f, "ISO_IMAGE"),
        }
    }
}

/// Disk controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusFamily {
    /// SCSI bus for persistent disks.
    Data,
    /// SATA bus for CD-ROMs.
    Removable,
}

impl BusFamily {
    /// Bus name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "SCSI",
            Self::Removable => "SATA",
        }
    }
}

impl fmt::Display for BusFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware type of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootType {
    #[default]
    Legacy,
    Uefi,
    SecureBoot,
}

impl BootType {
    /// Whether the firmware is UEFI based.
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi | Self::SecureBoot)
    }
}

/// Requested first boot device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootPriority {
    #[default]
    Cdrom,
    Disk,
}

/// Entry of a boot device order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Cdrom,
    Disk,
    Network,
}

impl BootDevice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cdrom => "CDROM",
            Self::Disk => "DISK",
            Self::Network => "NETWORK",
        }
    }
}

/// Boot configuration attached to a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub firmware: BootType,
    pub order: Vec<BootDevice>,
}

/// Machine chipset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineType {
    Pc,
    Q35,
}

impl MachineType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pc => "PC",
            Self::Q35 => "Q35",
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Status of an asynchronous control-plane task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    /// Whether no further transitions can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Key/value pair reported by a completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionDetail {
    pub name: String,
    pub value: String,
}

/// Entity touched by a task, such as the VM a create produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReference {
    pub ext_id: String,
    /// Relation name, e.g. `vmm:ahv:config:vm`.
    pub rel: String,
}

/// Snapshot of a task as returned by the status endpoint.
#[derive(Debug, Clone)]
pub struct Task {
    pub ext_id: String,
    pub status: TaskStatus,
    pub error_detail: Option<String>,
    pub completion_details: Vec<CompletionDetail>,
    pub entities_affected: Vec<EntityReference>,
}

/// Payload of a task that reached SUCCEEDED.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub details: Vec<CompletionDetail>,
    pub entities: Vec<EntityReference>,
}

impl TaskCompletion {
    /// Look up a completion detail by name.
    pub fn detail(&self, name: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }

    /// First affected entity whose relation ends with `kind` (e.g. `vm`).
    pub fn entity(&self, kind: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|e| e.rel.rsplit(':').next() == Some(kind))
            .map(|e| e.ext_id.as_str())
    }
}

impl From<Task> for TaskCompletion {
    fn from(task: Task) -> Self {
        Self {
            details: task.completion_details,
            entities: task.entities_affected,
        }
    }
}

// ============================================================================
// Images
// ============================================================================

/// Image type as stored by the image service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageType {
    DiskImage,
    IsoImage,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiskImage => "DISK_IMAGE",
            Self::IsoImage => "ISO_IMAGE",
        }
    }
}

/// Checksum algorithm for URL-sourced images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Algorithm tag on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA_1",
            Self::Sha256 => "SHA_256",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    /// Digests are compared case-insensitively.
    pub fn matches(&self, other: &Checksum) -> bool {
        self.algorithm == other.algorithm && self.value.eq_ignore_ascii_case(&other.value)
    }
}

/// Where a new image gets its bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Fetched by the control plane from a URL.
    Url(String),
    /// Uploaded from a local file after creation.
    Upload,
    /// Copied from a VM disk.
    VmDisk(String),
}

/// An image known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub ext_id: String,
    pub name: String,
    pub image_type: ImageType,
    pub source_url: Option<String>,
    pub checksum: Option<Checksum>,
    pub size_bytes: u64,
    pub categories: Vec<String>,
}

impl Image {
    /// An image is ready once it reports a size.
    pub fn is_ready(&self) -> bool {
        self.size_bytes > 0
    }
}

/// Payload for creating an image.
#[derive(Debug, Clone)]
pub struct ImageCreateRequest {
    pub name: String,
    pub description: String,
    pub image_type: ImageType,
    pub source: ImageSource,
    pub checksum: Option<Checksum>,
    /// Cluster the image is initially placed on.
    pub cluster_ext_id: Option<String>,
    /// Category ext ids.
    pub categories: Vec<String>,
}

/// Streaming body of a file download.
pub struct Download {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Content length if the server reported one.
    pub size: Option<u64>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download").field("size", &self.size).finish()
    }
}

// ============================================================================
// Named resources
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub ext_id: String,
    pub name: String,
    /// Prism Element (AOS) cluster, as opposed to Prism Central itself.
    pub is_aos: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetType {
    Vlan,
    /// Cluster-independent VPC subnet.
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub ext_id: String,
    pub name: String,
    pub subnet_type: SubnetType,
    pub cluster_refs: Vec<String>,
}

impl Subnet {
    pub fn belongs_to(&self, cluster_ext_id: &str) -> bool {
        self.cluster_refs.iter().any(|c| c == cluster_ext_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub ext_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ext_id: String,
    pub name: String,
    pub cluster_ext_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryEntry {
    pub ext_id: String,
    pub key: String,
    pub value: String,
}

/// GPU passthrough or vGPU mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuMode {
    PassthroughCompute,
    PassthroughGraphics,
    Virtual,
}

impl GpuMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PassthroughCompute => "PASSTHROUGH_COMPUTE",
            Self::PassthroughGraphics => "PASSTHROUGH_GRAPHICS",
            Self::Virtual => "VIRTUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Intel,
    Amd,
    Unknown,
}

impl GpuVendor {
    /// Map the vendor names reported by hosts.
    pub fn from_vendor_name(name: &str) -> Self {
        match name {
            "kNvidia" | "NVIDIA" => Self::Nvidia,
            "kIntel" | "INTEL" => Self::Intel,
            "kAmd" | "AMD" => Self::Amd,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nvidia => "NVIDIA",
            Self::Intel => "INTEL",
            Self::Amd => "AMD",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A GPU from a cluster's physical or virtual pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub device_id: Option<i64>,
    pub device_name: String,
    pub vendor_name: Option<String>,
    /// Physical GPU type, e.g. `PASSTHROUGH_GRAPHICS`.
    pub gpu_type: Option<String>,
    pub in_use: bool,
}

/// GPU resolved for attachment to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuAssignment {
    pub name: String,
    pub device_id: Option<i64>,
    pub mode: GpuMode,
    pub vendor: GpuVendor,
}

// ============================================================================
// Virtual machines
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    On,
    #[default]
    Off,
    Other,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

/// Disk or CD-ROM attached to an existing VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDisk {
    pub ext_id: String,
    pub bus: BusFamily,
    pub index: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmNic {
    pub ext_id: String,
    pub subnet_ext_id: Option<String>,
    /// Address assigned by the infrastructure (IPAM).
    pub configured_ip: Option<IpAddr>,
    /// Addresses reported by the guest agent.
    pub learned_ips: Vec<IpAddr>,
}

/// A virtual machine as observed on the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    pub ext_id: String,
    pub name: String,
    pub cluster_ext_id: Option<String>,
    pub power_state: PowerState,
    pub disks: Vec<VmDisk>,
    pub nics: Vec<VmNic>,
    pub has_guest_customization: bool,
}

impl Vm {
    /// Disks attached to the given bus family, in index order.
    pub fn disks_on(&self, bus: BusFamily) -> Vec<&VmDisk> {
        let mut disks: Vec<_> = self.disks.iter().filter(|d| d.bus == bus).collect();
        disks.sort_by_key(|d| d.index);
        disks
    }
}

/// Guest OS customization payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestCustomization {
    CloudInit { user_data: String },
    Sysprep { unattend_xml: String },
}

/// Disk entry of a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub role: DiskRole,
    pub bus: BusFamily,
    pub index: u32,
    pub size_bytes: Option<u64>,
    pub image_ext_id: Option<String>,
}

/// Provider create payload for a VM.
///
/// Never carries a power state: VMs are powered on by a separate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmCreateRequest {
    pub name: String,
    pub description: String,
    pub cluster_ext_id: String,
    pub num_sockets: u32,
    pub cores_per_socket: u32,
    pub memory_bytes: u64,
    pub disks: Vec<DiskSpec>,
    pub subnet_ext_ids: Vec<String>,
    pub boot: BootConfig,
    pub machine_type: Option<MachineType>,
    pub guest_customization: Option<GuestCustomization>,
    pub serial_ports: Vec<u32>,
    pub gpus: Vec<GpuAssignment>,
    pub vtpm: bool,
    pub hardware_virtualization: bool,
    pub categories: Vec<String>,
    pub project_ext_id: Option<String>,
}

/// Create payload plus the images to delete once the build ends.
#[derive(Debug, Clone)]
pub struct PreparedVm {
    pub request: VmCreateRequest,
    pub images_to_delete: Vec<String>,
}

/// Partial update of an existing VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub clear_guest_customization: bool,
}

// ============================================================================
// Exports and console
// ============================================================================

/// Disk format inside an OVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OvaFormat {
    #[default]
    Vmdk,
    Qcow2,
}

impl OvaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vmdk => "VMDK",
            Self::Qcow2 => "QCOW2",
        }
    }

    /// File extension of the exported package.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vmdk => "vmdk",
            Self::Qcow2 => "qcow2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ova {
    pub ext_id: String,
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Template creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Access to a VM's remote console.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsoleAccess {
    pub token: String,
    pub ws_uri: String,
    /// Full websocket URL including the token.
    pub url: String,
}

impl fmt::Debug for ConsoleAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleAccess")
            .field("ws_uri", &self.ws_uri)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_role_bus() {
        assert_eq!(DiskRole::Disk.bus(), BusFamily::Data);
        assert_eq!(DiskRole::DiskImage.bus(), BusFamily::Data);
        assert_eq!(DiskRole::IsoImage.bus(), BusFamily::Removable);
    }

    #[test]
    fn test_disk_role_deserialize() {
        let role: DiskRole = serde_json::from_str("\"DISK_IMAGE\"").unwrap();
        assert_eq!(role, DiskRole::DiskImage);
        assert!(serde_json::from_str::<DiskRole>("\"FLOPPY\"").is_err());
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        let unknown: TaskStatus = serde_json::from_str("\"SUSPENDED\"").unwrap();
        assert_eq!(unknown, TaskStatus::Unknown);
    }

    #[test]
    fn test_completion_entity_lookup() {
        let completion = TaskCompletion {
            details: vec![],
            entities: vec![EntityReference {
                ext_id: "abc".into(),
                rel: "vmm:ahv:config:vm".into(),
            }],
        };
        assert_eq!(completion.entity("vm"), Some("abc"));
        assert_eq!(completion.entity("image"), None);
    }

    #[test]
    fn test_checksum_match_ignores_case() {
        let a = Checksum {
            algorithm: ChecksumAlgorithm::Sha256,
            value: "ABCDEF".into(),
        };
        let b = Checksum {
            algorithm: ChecksumAlgorithm::Sha256,
            value: "abcdef".into(),
        };
        let c = Checksum {
            algorithm: ChecksumAlgorithm::Sha1,
            value: "abcdef".into(),
        };
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_gpu_vendor_mapping() {
        assert_eq!(GpuVendor::from_vendor_name("kNvidia"), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_name("AMD"), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_name("matrox"), GpuVendor::Unknown);
    }
}
