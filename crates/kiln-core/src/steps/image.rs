use super::{delete_image, vm_id};
use crate::error::{BuildError, Result};
use crate::state::{BuildState, ProducedImage};
use crate::step::{Step, StepAction, StepContext};
use crate::transfer::copy_to_file;
use async_trait::async_trait;
use kiln_prism::image::export_image_name;
use kiln_prism::BusFamily;

/// Save every data disk of the VM as an image.
///
/// Produced images are deleted in cleanup only when `image_delete` is set
/// and the build completed.
pub struct CreateImageStep;

#[async_trait]
impl Step for CreateImageStep {
    fn name(&self) -> &'static str {
        "create_image"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let cancel = &ctx.cancel;
        let vm = ctx.driver.get_vm(&vm_id(state)?, cancel).await?;
        let disks = vm.disks_on(BusFamily::Data);
        if disks.is_empty() {
            return Err(BuildError::NoDisksToSave);
        }

        let options = ctx.config.disk_export_options();
        for (index, disk) in disks.into_iter().enumerate() {
            let name = export_image_name(&options.base_name, index);
            ctx.ui.say(&format!("Creating image {name}..."));
            let image = ctx
                .driver
                .create_image_from_disk(&disk.ext_id, index, &options, cancel)
                .await?;
            ctx.ui
                .message(&format!("Image {} created ({})", image.name, image.ext_id));
            state.produced_images.push(ProducedImage {
                ext_id: image.ext_id,
                name: image.name,
                size_bytes: disk.size_bytes,
            });
        }
        Ok(StepAction::Continue)
    }

    async fn cleanup(&self, ctx: &StepContext, state: &mut BuildState) {
        if !ctx.config.image_delete || state.interrupted() {
            return;
        }
        let produced: Vec<String> = state
            .produced_images
            .iter()
            .map(|i| i.ext_id.clone())
            .collect();
        for ext_id in produced {
            ctx.ui.say(&format!("Deleting image {ext_id}..."));
            delete_image(ctx, state, &ext_id).await;
        }
    }
}

/// Download every produced image into the output directory.
///
/// Each image is written to `<name>.tmp`, checked against the disk size
/// and renamed to `<name>.img`.
pub struct ExportImageStep;

#[async_trait]
impl Step for ExportImageStep {
    fn name(&self) -> &'static str {
        "export_image"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let cancel = &ctx.cancel;
        let output_dir = &ctx.config.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        for image in state.produced_images.clone() {
            let tmp = output_dir.join(format!("{}.tmp", image.name));
            ctx.ui.say(&format!("Downloading image {}...", image.name));

            let download = ctx.driver.export_image(&image.ext_id, cancel).await?;
            let reader = ctx
                .ui
                .track_progress(&image.name, download.size.or(Some(image.size_bytes)), download.reader);
            let written = copy_to_file(reader, &tmp, cancel).await?;

            if image.size_bytes > 0 && written != image.size_bytes {
                tokio::fs::remove_file(&tmp).await?;
                return Err(BuildError::SizeMismatch {
                    path: tmp,
                    expected: image.size_bytes,
                    actual: written,
                });
            }

            let path = output_dir.join(format!("{}.img", image.name));
            tokio::fs::rename(&tmp, &path).await?;
            tracing::info!(image = %image.ext_id, path = %path.display(), bytes = written, "Image exported");
            ctx.ui.message(&format!("Saved {}", path.display()));
            state.exported_files.push(path);
        }
        Ok(StepAction::Continue)
    }
}
