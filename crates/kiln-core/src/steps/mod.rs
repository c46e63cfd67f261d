//! Build steps, in the order the builder assembles them.

mod clean;
mod console;
mod create_vm;
mod image;
mod network;
mod ova;
mod power;
mod template;

pub use clean::CleanVmStep;
pub use console::{BootCommandStep, ConsoleConnectStep};
pub use create_vm::CreateVmStep;
pub use image::{CreateImageStep, ExportImageStep};
pub use network::{ProvisionStep, WaitForIpStep};
pub use ova::{CreateOvaStep, ExportOvaStep};
pub use power::{PowerOnStep, ShutdownStep};
pub use template::CreateTemplateStep;

use crate::artifact::CleanupAction;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::StepContext;
use std::fmt;

/// The VM created by [`CreateVmStep`].
fn vm_id(state: &BuildState) -> Result<String> {
    state
        .vm_ext_id
        .clone()
        .ok_or(BuildError::MissingState("vm"))
}

/// Delete an image during cleanup, recording the outcome.
async fn delete_image(ctx: &StepContext, state: &mut BuildState, ext_id: &str) {
    match ctx.driver.delete_image(ext_id, &ctx.cancel).await {
        Ok(()) => state.record(CleanupAction::ImageDeleted(ext_id.to_string())),
        Err(e) => cleanup_failed(ctx, state, format!("image {ext_id}"), e),
    }
}

fn cleanup_failed(ctx: &StepContext, state: &mut BuildState, target: String, error: impl fmt::Display) {
    tracing::error!(resource = %target, error = %error, "Cleanup failed");
    ctx.ui.error(&format!("failed to clean up {target}: {error}"));
    state.record(CleanupAction::Failed {
        target,
        error: error.to_string(),
    });
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the step tests.

    use crate::collab::TracingUi;
    use crate::config::{BuildConfig, CommunicatorType};
    use crate::step::StepContext;
    use kiln_prism::{
        BusFamily, Cluster, FakePrism, PowerState, PrismDriver, TaskWaiter, Vm, VmDisk,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    pub const VM: &str = "vm-1";

    pub fn fake() -> Arc<FakePrism> {
        let fake = Arc::new(FakePrism::new());
        fake.add_cluster(Cluster {
            ext_id: "c-1".into(),
            name: "pe".into(),
            is_aos: true,
        });
        fake
    }

    /// Powered-off VM with one data disk per size and one CD-ROM.
    pub fn add_vm(fake: &FakePrism, disk_sizes: &[u64]) {
        let mut disks: Vec<VmDisk> = disk_sizes
            .iter()
            .enumerate()
            .map(|(i, size)| VmDisk {
                ext_id: format!("scsi-{i}"),
                bus: BusFamily::Data,
                index: i as u32,
                size_bytes: *size,
            })
            .collect();
        disks.push(VmDisk {
            ext_id: "sata-0".into(),
            bus: BusFamily::Removable,
            index: 0,
            size_bytes: 0,
        });
        fake.add_vm(Vm {
            ext_id: VM.into(),
            name: "builder".into(),
            cluster_ext_id: Some("c-1".into()),
            power_state: PowerState::Off,
            disks,
            nics: vec![],
            has_guest_customization: true,
        });
    }

    pub fn config() -> BuildConfig {
        let mut config = BuildConfig {
            communicator: CommunicatorType::None,
            task_poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        config.vm.vm_name = "builder".into();
        config.vm.image_name = "golden".into();
        config.vm.cluster_name = Some("pe".into());
        config.vm.disks = vec![kiln_prism::DiskConfig::data(1)];
        config.apply_defaults();
        config
    }

    pub fn context(fake: &Arc<FakePrism>, config: BuildConfig) -> StepContext {
        let driver = PrismDriver::new(fake.clone())
            .with_waiter(TaskWaiter::new(Duration::from_secs(1), Duration::from_secs(60)));
        StepContext {
            driver: Arc::new(driver),
            config: Arc::new(config),
            ui: Arc::new(TracingUi),
            communicator: None,
            console: None,
            cancel: CancellationToken::new(),
            cleanup_cancel: CancellationToken::new(),
        }
    }
}
