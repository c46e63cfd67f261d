//! Build description.
//!
//! A [`BuildConfig`] is deserialized from the JSON build file. The VM
//! description fields ([`VmConfig`]) sit at the top level next to the
//! build options; every optional field has a serde default.

use crate::error::{BuildError, Result};
use kiln_prism::{
    Category, Cidr, DedupPolicy, DiskExportOptions, DiskRole, IpWaitConfig, OvaFormat, TaskWaiter,
    TemplateSpec, VmConfig, DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Description given to built images when none is configured.
pub const DEFAULT_IMAGE_DESCRIPTION: &str = "built by kiln";

/// Prefix of generated VM names.
const VM_NAME_PREFIX: &str = "kiln-";

/// Shortest accepted task poll interval.
pub const MIN_TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the build reaches the guest once it has an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorType {
    #[default]
    Ssh,
    /// No remote commands; the VM is powered off instead of shut down.
    None,
}

/// OVA packaging of the built VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvaConfig {
    /// Create an OVA on Prism Central.
    pub create: bool,
    /// Download the OVA into the output directory.
    pub export: bool,
    /// Disk format, `vmdk` or `qcow2`.
    pub format: String,
    /// OVA name (default: the image name).
    pub name: String,
}

impl Default for OvaConfig {
    fn default() -> Self {
        Self {
            create: false,
            export: false,
            format: "vmdk".to_string(),
            name: String::new(),
        }
    }
}

impl OvaConfig {
    /// Parsed disk format, or `None` when unsupported.
    pub fn format(&self) -> Option<OvaFormat> {
        match self.format.to_ascii_lowercase().as_str() {
            "vmdk" => Some(OvaFormat::Vmdk),
            "qcow2" => Some(OvaFormat::Qcow2),
            _ => None,
        }
    }
}

/// Template created from the built VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub create: bool,
    /// Template name (default: the image name).
    pub name: String,
    pub description: Option<String>,
}

impl TemplateConfig {
    pub fn spec(&self) -> TemplateSpec {
        TemplateSpec {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// Pre-capture cleanup of the VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    /// Detach every CD-ROM.
    pub cdrom: bool,
    /// Drop cloud-init/sysprep data.
    pub guest_customization: bool,
}

impl CleanConfig {
    pub fn any(&self) -> bool {
        self.cdrom || self.guest_customization
    }
}

/// Complete description of one image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    #[serde(flatten)]
    pub vm: VmConfig,

    // Produced images
    /// Delete a single existing image with the export name first.
    pub force_deregister: bool,
    /// Fail when an image with the export name exists.
    pub fail_if_image_exists: bool,
    pub image_description: Option<String>,
    pub image_categories: Vec<Category>,
    /// Delete produced images once the build succeeds.
    pub image_delete: bool,
    /// Download produced images into `output_dir`.
    pub image_export: bool,
    /// Do not capture images at all.
    pub image_skip: bool,

    // Build VM
    /// Delete the VM even when the build failed.
    pub vm_force_delete: bool,
    /// Keep the VM after a successful build.
    pub vm_retain: bool,
    /// Local ISO uploaded and attached as an extra CD-ROM.
    pub cd_path: Option<PathBuf>,

    // Addressing
    #[serde(with = "humantime_serde")]
    pub ip_wait_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ip_settle_timeout: Duration,
    /// CIDR the guest address must fall in; empty accepts any routable IPv4.
    pub ip_wait_address: String,

    // Shutdown
    pub shutdown_command: Option<String>,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    // Guest access
    pub communicator: CommunicatorType,
    /// Address the communicator connects to instead of the acquired IP.
    pub ssh_host: Option<String>,
    /// Inline shell commands run in order once the guest is reachable.
    pub provision: Vec<String>,

    // Console
    pub boot_command: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub boot_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub boot_key_interval: Duration,
    pub disable_vnc: bool,

    pub ova: OvaConfig,
    pub template: TemplateConfig,
    pub clean: CleanConfig,

    // Task polling
    #[serde(with = "humantime_serde")]
    pub task_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Directory receiving exported files.
    pub output_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let ip = IpWaitConfig::default();
        Self {
            vm: VmConfig::default(),
            force_deregister: false,
            fail_if_image_exists: false,
            image_description: None,
            image_categories: Vec::new(),
            image_delete: false,
            image_export: false,
            image_skip: false,
            vm_force_delete: false,
            vm_retain: false,
            cd_path: None,
            ip_wait_timeout: ip.wait_timeout,
            ip_settle_timeout: ip.settle_timeout,
            ip_wait_address: "0.0.0.0/0".to_string(),
            shutdown_command: None,
            shutdown_timeout: Duration::from_secs(5 * 60),
            communicator: CommunicatorType::Ssh,
            ssh_host: None,
            provision: Vec::new(),
            boot_command: Vec::new(),
            boot_wait: Duration::from_secs(10),
            boot_key_interval: Duration::from_millis(100),
            disable_vnc: false,
            ova: OvaConfig::default(),
            template: TemplateConfig::default(),
            clean: CleanConfig::default(),
            task_poll_interval: DEFAULT_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            output_dir: PathBuf::from("."),
        }
    }
}

impl BuildConfig {
    /// Create a new config builder.
    pub fn builder() -> BuildConfigBuilder {
        BuildConfigBuilder::default()
    }

    /// Parse a JSON build file.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill in the names derived from other fields.
    pub fn apply_defaults(&mut self) {
        if self.vm.vm_name.is_empty() {
            self.vm.vm_name = generated_vm_name();
        }
        if self.vm.image_name.is_empty() {
            self.vm.image_name = self.vm.vm_name.clone();
        }
        if self.ova.name.is_empty() {
            self.ova.name = self.vm.image_name.clone();
        }
        if self.template.name.is_empty() {
            self.template.name = self.vm.image_name.clone();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.vm.validate().map_err(invalid)?;

        if self.force_deregister && self.fail_if_image_exists {
            return Err(BuildError::InvalidConfig(
                "force_deregister and fail_if_image_exists are mutually exclusive".into(),
            ));
        }
        for category in &self.image_categories {
            if category.key.is_empty() || category.value.is_empty() {
                return Err(BuildError::InvalidConfig(format!(
                    "incomplete image category '{category}'"
                )));
            }
        }
        for (i, disk) in self.vm.disks.iter().enumerate() {
            if disk.source_image_path.is_some() && disk.image_type == DiskRole::Disk {
                return Err(BuildError::InvalidConfig(format!(
                    "vm_disks {}: source_image_path needs DISK_IMAGE or ISO_IMAGE",
                    i + 1
                )));
            }
        }
        if self.communicator == CommunicatorType::Ssh && self.vm.nics.is_empty() {
            return Err(BuildError::InvalidConfig(
                "the ssh communicator needs at least one vm_nics entry".into(),
            ));
        }
        self.wait_address()?;
        if self.image_export && self.image_skip {
            return Err(BuildError::InvalidConfig(
                "image_export needs an image; unset image_skip".into(),
            ));
        }
        if self.task_poll_interval < MIN_TASK_POLL_INTERVAL {
            return Err(BuildError::InvalidConfig(format!(
                "task_poll_interval must be at least {MIN_TASK_POLL_INTERVAL:?}"
            )));
        }
        Ok(())
    }

    fn wait_address(&self) -> Result<Option<Cidr>> {
        let raw = self.ip_wait_address.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(invalid)
    }

    /// Bounds for IP acquisition.
    pub fn ip_wait(&self) -> Result<IpWaitConfig> {
        Ok(IpWaitConfig {
            wait_timeout: self.ip_wait_timeout,
            settle_timeout: self.ip_settle_timeout,
            wait_address: self.wait_address()?,
        })
    }

    /// Task poll policy applied to every control-plane task.
    pub fn task_waiter(&self) -> TaskWaiter {
        TaskWaiter::new(self.task_poll_interval, self.task_timeout)
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        if self.fail_if_image_exists {
            DedupPolicy::FailIfImageExists
        } else if self.force_deregister {
            DedupPolicy::ForceDeregister
        } else {
            DedupPolicy::Keep
        }
    }

    /// Options for saving the VM's disks as images.
    pub fn disk_export_options(&self) -> DiskExportOptions {
        DiskExportOptions {
            base_name: self.vm.image_name.clone(),
            description: self
                .image_description
                .clone()
                .unwrap_or_else(|| DEFAULT_IMAGE_DESCRIPTION.to_string()),
            categories: self.image_categories.clone(),
            policy: self.dedup_policy(),
        }
    }
}

fn invalid(e: kiln_prism::PrismError) -> BuildError {
    match e {
        kiln_prism::PrismError::InvalidConfig(msg) => BuildError::InvalidConfig(msg),
        other => BuildError::Prism(other),
    }
}

/// `kiln-` followed by eight uppercase alphanumerics.
fn generated_vm_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{VM_NAME_PREFIX}{}", id[..8].to_ascii_uppercase())
}

/// Builder for BuildConfig.
#[derive(Debug, Default)]
pub struct BuildConfigBuilder {
    config: BuildConfig,
}

impl BuildConfigBuilder {
    /// Set the VM description.
    pub fn vm(mut self, vm: VmConfig) -> Self {
        self.config.vm = vm;
        self
    }

    pub fn image_name(mut self, name: impl Into<String>) -> Self {
        self.config.vm.image_name = name.into();
        self
    }

    pub fn communicator(mut self, communicator: CommunicatorType) -> Self {
        self.config.communicator = communicator;
        self
    }

    pub fn force_deregister(mut self, force: bool) -> Self {
        self.config.force_deregister = force;
        self
    }

    pub fn fail_if_image_exists(mut self, fail: bool) -> Self {
        self.config.fail_if_image_exists = fail;
        self
    }

    pub fn image_skip(mut self, skip: bool) -> Self {
        self.config.image_skip = skip;
        self
    }

    pub fn image_export(mut self, export: bool) -> Self {
        self.config.image_export = export;
        self
    }

    pub fn image_delete(mut self, delete: bool) -> Self {
        self.config.image_delete = delete;
        self
    }

    pub fn vm_force_delete(mut self, force: bool) -> Self {
        self.config.vm_force_delete = force;
        self
    }

    pub fn vm_retain(mut self, retain: bool) -> Self {
        self.config.vm_retain = retain;
        self
    }

    pub fn cd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cd_path = Some(path.into());
        self
    }

    pub fn shutdown_command(mut self, command: impl Into<String>) -> Self {
        self.config.shutdown_command = Some(command.into());
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn ssh_host(mut self, host: impl Into<String>) -> Self {
        self.config.ssh_host = Some(host.into());
        self
    }

    pub fn provision(mut self, command: impl Into<String>) -> Self {
        self.config.provision.push(command.into());
        self
    }

    pub fn boot_command(mut self, lines: Vec<String>) -> Self {
        self.config.boot_command = lines;
        self
    }

    pub fn ova(mut self, ova: OvaConfig) -> Self {
        self.config.ova = ova;
        self
    }

    pub fn template(mut self, template: TemplateConfig) -> Self {
        self.config.template = template;
        self
    }

    pub fn clean(mut self, clean: CleanConfig) -> Self {
        self.config.clean = clean;
        self
    }

    /// Set the task poll interval and overall task budget.
    pub fn task_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.config.task_poll_interval = poll_interval;
        self.config.task_timeout = timeout;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Apply name defaults and validate.
    pub fn build(mut self) -> Result<BuildConfig> {
        self.config.apply_defaults();
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_prism::{DiskConfig, NicConfig};

    fn vm() -> VmConfig {
        VmConfig {
            cluster_name: Some("pe-01".into()),
            disks: vec![DiskConfig::data(20)],
            nics: vec![NicConfig {
                subnet_name: Some("vlan.10".into()),
                subnet_uuid: None,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = BuildConfig::default();
        assert_eq!(config.ip_wait_timeout, Duration::from_secs(15 * 60));
        assert_eq!(config.ip_settle_timeout, Duration::from_secs(5));
        assert_eq!(config.ip_wait_address, "0.0.0.0/0");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(300));
        assert_eq!(config.task_poll_interval, Duration::from_secs(5));
        assert_eq!(config.boot_wait, Duration::from_secs(10));
        assert_eq!(config.ova.format(), Some(OvaFormat::Vmdk));
        assert_eq!(config.communicator, CommunicatorType::Ssh);
    }

    #[test]
    fn test_generated_names() {
        let config = BuildConfig::builder().vm(vm()).build().unwrap();
        let suffix = config.vm.vm_name.strip_prefix("kiln-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(config.vm.image_name, config.vm.vm_name);
        assert_eq!(config.ova.name, config.vm.image_name);
        assert_eq!(config.template.name, config.vm.image_name);
    }

    #[test]
    fn test_explicit_image_name_kept() {
        let config = BuildConfig::builder()
            .vm(vm())
            .image_name("golden")
            .build()
            .unwrap();
        assert_eq!(config.vm.image_name, "golden");
        assert_eq!(config.ova.name, "golden");
    }

    #[test]
    fn test_dedup_flags_conflict() {
        let result = BuildConfig::builder()
            .vm(vm())
            .force_deregister(true)
            .fail_if_image_exists(true)
            .build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_ssh_requires_nic() {
        let result = BuildConfig::builder()
            .vm(VmConfig {
                nics: vec![],
                ..vm()
            })
            .build();
        assert!(result.is_err());

        let config = BuildConfig::builder()
            .vm(VmConfig {
                nics: vec![],
                ..vm()
            })
            .communicator(CommunicatorType::None)
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_vm_errors_surface_as_invalid_config() {
        let result = BuildConfig::builder().vm(VmConfig::default()).build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_wait_address_disables_filter() {
        let config = BuildConfig {
            ip_wait_address: String::new(),
            ..Default::default()
        };
        assert_eq!(config.ip_wait().unwrap().wait_address, None);

        let config = BuildConfig {
            ip_wait_address: "10.0.0.0/8".into(),
            ..Default::default()
        };
        let cidr = config.ip_wait().unwrap().wait_address.unwrap();
        assert!(cidr.contains(&"10.1.2.3".parse().unwrap()));

        let config = BuildConfig {
            ip_wait_address: "nonsense".into(),
            vm: vm(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dedup_policy_and_export_options() {
        let config = BuildConfig {
            force_deregister: true,
            ..Default::default()
        };
        assert_eq!(config.dedup_policy(), DedupPolicy::ForceDeregister);
        let options = config.disk_export_options();
        assert_eq!(options.description, DEFAULT_IMAGE_DESCRIPTION);
        assert_eq!(options.policy, DedupPolicy::ForceDeregister);
    }

    #[test]
    fn test_export_requires_image() {
        let result = BuildConfig::builder()
            .vm(vm())
            .image_skip(true)
            .image_export(true)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "vm_name": "builder",
            "cluster_name": "pe-01",
            "vm_disks": [{"image_type": "DISK", "disk_size_gb": 40}],
            "vm_nics": [{"subnet_name": "vlan.10"}],
            "image_name": "golden",
            "force_deregister": true,
            "ip_wait_timeout": "20m",
            "shutdown_command": "sudo shutdown -P now",
            "ova": {"create": true, "format": "qcow2"},
            "clean": {"cdrom": true}
        }"#;
        let config = BuildConfig::from_json(json).unwrap();
        assert_eq!(config.vm.vm_name, "builder");
        assert_eq!(config.vm.memory_mb, 4096);
        assert_eq!(config.ip_wait_timeout, Duration::from_secs(20 * 60));
        assert_eq!(config.ova.format(), Some(OvaFormat::Qcow2));
        assert_eq!(config.ova.name, "golden");
        assert!(config.clean.cdrom);
        assert!(!config.clean.guest_customization);
        config.validate().unwrap();
    }

    #[test]
    fn test_poll_interval_lower_bound() {
        let result = BuildConfig::builder()
            .vm(vm())
            .task_timing(Duration::from_micros(500), Duration::from_secs(60))
            .build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(ref msg)) if msg.contains("task_poll_interval")));

        let json = r#"{
            "cluster_name": "pe-01",
            "vm_disks": [{"image_type": "DISK", "disk_size_gb": 40}],
            "vm_nics": [{"subnet_name": "vlan.10"}],
            "task_poll_interval": "500us"
        }"#;
        let config = BuildConfig::from_json(json).unwrap();
        assert!(config.validate().is_err());

        let config = BuildConfig::builder()
            .vm(vm())
            .task_timing(MIN_TASK_POLL_INTERVAL, Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(config.task_waiter().budget(), 60);
    }

    #[test]
    fn test_unsupported_ova_format() {
        let ova = OvaConfig {
            format: "vhdx".into(),
            ..Default::default()
        };
        assert_eq!(ova.format(), None);
    }
}
