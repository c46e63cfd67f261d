use super::{cleanup_failed, delete_image};
use crate::artifact::CleanupAction;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;
use kiln_prism::{DiskConfig, DiskRole, ImageType};

/// Upload local media, then create the build VM.
///
/// Cleanup deletes the uploaded CD image and every image marked for
/// deletion, and applies the VM retention policy.
pub struct CreateVmStep;

#[async_trait]
impl Step for CreateVmStep {
    fn name(&self) -> &'static str {
        "create_vm"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let config = &ctx.config;
        let cancel = &ctx.cancel;
        let mut vm = config.vm.clone();

        for disk in vm.disks.iter_mut() {
            let Some(path) = disk.source_image_path.take() else {
                continue;
            };
            let image_type = disk.image_type.image_type().ok_or_else(|| {
                BuildError::InvalidConfig(format!(
                    "{} disk cannot use source_image_path",
                    disk.image_type
                ))
            })?;

            ctx.ui.say(&format!("Uploading {}...", path.display()));
            let image = ctx
                .driver
                .create_image_file(&path, image_type, &config.vm, cancel)
                .await?;
            state.uploaded_images.push(image.ext_id.clone());
            if disk.source_image_delete {
                state.delete_later(image.ext_id.clone());
            }
            disk.source_image_uuid = Some(image.ext_id);
        }

        if let Some(cd_path) = &config.cd_path {
            ctx.ui.say(&format!("Uploading CD image {}...", cd_path.display()));
            let image = ctx
                .driver
                .create_image_file(cd_path, ImageType::IsoImage, &config.vm, cancel)
                .await?;
            state.cd_image = Some(image.ext_id.clone());
            vm.disks.push(DiskConfig {
                source_image_uuid: Some(image.ext_id),
                ..DiskConfig::new(DiskRole::IsoImage)
            });
        }

        ctx.ui.say("Creating VM...");
        let prepared = ctx.driver.create_request(&vm, cancel).await?;
        for ext_id in prepared.images_to_delete {
            state.delete_later(ext_id);
        }
        state.cluster_ext_id = Some(prepared.request.cluster_ext_id.clone());

        let created = ctx.driver.create(&prepared.request, cancel).await?;
        ctx.ui
            .message(&format!("VM {} created ({})", created.name, created.ext_id));
        state.vm_ext_id = Some(created.ext_id);
        Ok(StepAction::Continue)
    }

    async fn cleanup(&self, ctx: &StepContext, state: &mut BuildState) {
        if let Some(vm) = state.vm_ext_id.clone() {
            let config = &ctx.config;
            let delete = if state.interrupted() {
                config.vm_force_delete
            } else {
                !config.vm_retain
            };

            if delete {
                ctx.ui.say(&format!("Deleting VM {vm}..."));
                match ctx.driver.delete(&vm, &ctx.cancel).await {
                    Ok(()) => state.record(CleanupAction::VmDeleted(vm)),
                    Err(e) => cleanup_failed(ctx, state, format!("vm {vm}"), e),
                }
            } else {
                if state.interrupted() {
                    ctx.ui.say(&format!("Retaining VM {vm} for debugging"));
                } else {
                    ctx.ui.say(&format!("Retaining VM {vm}"));
                }
                state.record(CleanupAction::VmRetained(vm));
            }
        }

        let images: Vec<String> = state
            .cd_image
            .iter()
            .chain(state.images_to_delete.iter())
            .cloned()
            .collect();
        for ext_id in images {
            delete_image(ctx, state, &ext_id).await;
        }
    }
}
