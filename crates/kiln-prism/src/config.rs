//! Connection settings and the declarative VM description.

use crate::error::PrismError;
use crate::types::{BootPriority, BootType, ChecksumAlgorithm, Checksum, DiskRole};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default Prism Central port.
pub const DEFAULT_PORT: u16 = 9440;

/// Connection settings for a Prism Central instance.
#[derive(Clone, PartialEq, Eq)]
pub struct PrismEndpoint {
    /// Hostname or address.
    pub endpoint: String,
    /// HTTPS port (default: 9440).
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Connect timeout for the HTTP client.
    pub connect_timeout: Duration,
    /// Per-request timeout (not applied to streaming downloads).
    pub request_timeout: Duration,
}

impl PrismEndpoint {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: password.into(),
            insecure: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }

    /// `host:port` authority.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.endpoint, self.port)
    }

    /// Base URL of the REST API.
    pub fn base_url(&self) -> String {
        format!("https://{}", self.authority())
    }

    /// Key identifying a connection in the client cache.
    pub fn fingerprint(&self) -> String {
        format!("kiln:{}:{}:{}", self.endpoint, self.port, self.username)
    }

    pub fn validate(&self) -> Result<(), PrismError> {
        if self.endpoint.is_empty() {
            return Err(PrismError::InvalidConfig("endpoint is required".into()));
        }
        if self.username.is_empty() {
            return Err(PrismError::InvalidConfig("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(PrismError::InvalidConfig("password is required".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for PrismEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrismEndpoint")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Guest operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OsType {
    #[default]
    Linux,
    Windows,
}

/// Category key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    pub value: String,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// One disk of the VM description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub image_type: DiskRole,
    #[serde(default)]
    pub source_image_name: Option<String>,
    #[serde(default)]
    pub source_image_uuid: Option<String>,
    #[serde(default)]
    pub source_image_uri: Option<String>,
    /// Local file uploaded as the source image before the VM is created.
    #[serde(default)]
    pub source_image_path: Option<PathBuf>,
    /// Delete the source image when the build ends.
    #[serde(default)]
    pub source_image_delete: bool,
    /// Recreate a URL-sourced image even if a usable one exists.
    #[serde(default)]
    pub source_image_force: bool,
    #[serde(default)]
    pub source_image_checksum: Option<String>,
    #[serde(default)]
    pub source_image_checksum_type: Option<ChecksumAlgorithm>,
    #[serde(default)]
    pub disk_size_gb: Option<u64>,
}

impl DiskConfig {
    /// A disk with only a role set.
    pub fn new(image_type: DiskRole) -> Self {
        Self {
            image_type,
            source_image_name: None,
            source_image_uuid: None,
            source_image_uri: None,
            source_image_path: None,
            source_image_delete: false,
            source_image_force: false,
            source_image_checksum: None,
            source_image_checksum_type: None,
            disk_size_gb: None,
        }
    }

    /// Empty data disk.
    pub fn data(size_gb: u64) -> Self {
        Self {
            disk_size_gb: Some(size_gb),
            ..Self::new(DiskRole::Disk)
        }
    }

    /// Checksum declared for a URL source, if any.
    ///
    /// SHA-256 is assumed when no algorithm is given.
    pub fn checksum(&self) -> Option<Checksum> {
        self.source_image_checksum
            .as_ref()
            .filter(|v| !v.is_empty())
            .map(|value| Checksum {
                algorithm: self
                    .source_image_checksum_type
                    .unwrap_or(ChecksumAlgorithm::Sha256),
                value: value.clone(),
            })
    }
}

/// One NIC of the VM description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    #[serde(default)]
    pub subnet_name: Option<String>,
    #[serde(default)]
    pub subnet_uuid: Option<String>,
}

/// GPU requested by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuConfig {
    pub name: String,
    /// Device id to pick when several GPU profiles share a name.
    #[serde(default)]
    pub device_id: Option<i64>,
}

/// Declarative description of the build VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub vm_name: String,
    pub os_type: OsType,
    pub boot_type: BootType,
    pub boot_priority: BootPriority,
    #[serde(rename = "vm_disks")]
    pub disks: Vec<DiskConfig>,
    #[serde(rename = "vm_nics")]
    pub nics: Vec<NicConfig>,
    pub image_name: String,
    pub cluster_uuid: Option<String>,
    pub cluster_name: Option<String>,
    /// Number of sockets (default: 1).
    pub cpu: u32,
    /// Cores per socket (default: 1).
    pub core: u32,
    /// Memory in MiB (default: 4096).
    pub memory_mb: u64,
    pub user_data: Option<String>,
    #[serde(rename = "vm_categories")]
    pub categories: Vec<Category>,
    pub project: Option<String>,
    #[serde(rename = "gpu")]
    pub gpus: Vec<GpuConfig>,
    pub serial_port: bool,
    pub vtpm: bool,
    pub hardware_virtualization: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vm_name: String::new(),
            os_type: OsType::Linux,
            boot_type: BootType::Legacy,
            boot_priority: BootPriority::Cdrom,
            disks: Vec::new(),
            nics: Vec::new(),
            image_name: String::new(),
            cluster_uuid: None,
            cluster_name: None,
            cpu: 1,
            core: 1,
            memory_mb: 4096,
            user_data: None,
            categories: Vec::new(),
            project: None,
            gpus: Vec::new(),
            serial_port: false,
            vtpm: false,
            hardware_virtualization: false,
        }
    }
}

impl VmConfig {
    /// Structural checks on the description.
    pub fn validate(&self) -> Result<(), PrismError> {
        if self.cluster_name.as_deref().unwrap_or("").is_empty()
            && self.cluster_uuid.as_deref().unwrap_or("").is_empty()
        {
            return Err(PrismError::InvalidConfig(
                "missing cluster_name or cluster_uuid".into(),
            ));
        }
        if self.disks.is_empty() {
            return Err(PrismError::InvalidConfig("missing vm_disks".into()));
        }
        if self.cpu == 0 || self.core == 0 {
            return Err(PrismError::InvalidConfig("cpu and core must be > 0".into()));
        }
        if self.memory_mb == 0 {
            return Err(PrismError::InvalidConfig("memory_mb must be > 0".into()));
        }
        if self.vtpm && !self.boot_type.is_uefi() {
            return Err(PrismError::InvalidConfig(
                "vtpm requires uefi or secure_boot firmware".into(),
            ));
        }
        for (i, disk) in self.disks.iter().enumerate() {
            if disk.image_type == DiskRole::Disk && disk.disk_size_gb.unwrap_or(0) == 0 {
                return Err(PrismError::InvalidConfig(format!(
                    "vm_disks {}: DISK requires disk_size_gb",
                    i + 1
                )));
            }
        }
        for (i, nic) in self.nics.iter().enumerate() {
            if nic.subnet_name.as_deref().unwrap_or("").is_empty()
                && nic.subnet_uuid.as_deref().unwrap_or("").is_empty()
            {
                return Err(PrismError::InvalidConfig(format!(
                    "missing subnet in vm_nics {}",
                    i + 1
                )));
            }
        }
        for category in &self.categories {
            if category.key.is_empty() || category.value.is_empty() {
                return Err(PrismError::InvalidConfig(format!(
                    "incomplete vm category '{category}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> VmConfig {
        VmConfig {
            cluster_name: Some("pe-01".into()),
            disks: vec![DiskConfig::data(20)],
            ..Default::default()
        }
    }

    #[test]
    fn test_vm_config_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.cpu, 1);
        assert_eq!(config.memory_mb, 4096);
        assert_eq!(config.boot_type, BootType::Legacy);
        assert_eq!(config.boot_priority, BootPriority::Cdrom);
    }

    #[test]
    fn test_validate_requires_cluster() {
        let config = VmConfig {
            cluster_name: None,
            ..minimal()
        };
        assert!(config.validate().is_err());
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_validate_vtpm_needs_uefi() {
        let config = VmConfig {
            vtpm: true,
            ..minimal()
        };
        assert!(config.validate().is_err());

        let config = VmConfig {
            vtpm: true,
            boot_type: BootType::SecureBoot,
            ..minimal()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_data_disk_size() {
        let config = VmConfig {
            disks: vec![DiskConfig::new(DiskRole::Disk)],
            ..minimal()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checksum_defaults_to_sha256() {
        let disk = DiskConfig {
            source_image_checksum: Some("abc".into()),
            ..DiskConfig::new(DiskRole::DiskImage)
        };
        let checksum = disk.checksum().unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha256);
    }

    #[test]
    fn test_endpoint_fingerprint_and_debug() {
        let endpoint = PrismEndpoint::new("pc.local", "admin", "secret");
        assert_eq!(endpoint.fingerprint(), "kiln:pc.local:9440:admin");
        assert!(!format!("{endpoint:?}").contains("secret"));
    }

    #[test]
    fn test_deserialize_vm_config() {
        let json = r#"{
            "vm_name": "builder",
            "cluster_name": "pe-01",
            "boot_type": "uefi",
            "vm_disks": [
                {"image_type": "ISO_IMAGE", "source_image_name": "ubuntu.iso"},
                {"image_type": "DISK", "disk_size_gb": 40}
            ],
            "vm_nics": [{"subnet_name": "vlan.10"}]
        }"#;
        let config: VmConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.boot_type, BootType::Uefi);
        assert_eq!(config.disks.len(), 2);
        assert_eq!(config.disks[0].image_type, DiskRole::IsoImage);
        assert_eq!(config.memory_mb, 4096);
    }
}
