use super::vm_id;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use crate::transfer::copy_to_file;
use async_trait::async_trait;

/// Package the stopped VM as an OVA on Prism Central.
pub struct CreateOvaStep;

#[async_trait]
impl Step for CreateOvaStep {
    fn name(&self) -> &'static str {
        "create_ova"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let ova = &ctx.config.ova;
        let Some(format) = ova.format() else {
            ctx.ui
                .say(&format!("OVA format '{}' is not supported, skipping OVA creation", ova.format));
            return Ok(StepAction::Continue);
        };
        let vm = vm_id(state)?;

        ctx.ui
            .say(&format!("Creating OVA {} ({})...", ova.name, format.as_str()));
        ctx.driver.create_ova(&vm, &ova.name, format, &ctx.cancel).await?;
        Ok(StepAction::Continue)
    }
}

/// Download the OVA into the output directory.
pub struct ExportOvaStep;

#[async_trait]
impl Step for ExportOvaStep {
    fn name(&self) -> &'static str {
        "export_ova"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let ova = &ctx.config.ova;
        let cancel = &ctx.cancel;
        let Some(format) = ova.format() else {
            ctx.ui
                .say(&format!("OVA format '{}' is not supported, skipping OVA export", ova.format));
            return Ok(StepAction::Continue);
        };
        let vm = vm_id(state)?;
        let output_dir = &ctx.config.output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        ctx.ui.say(&format!("Downloading OVA {}...", ova.name));
        let download = ctx.driver.export_ova(&ova.name, cancel).await?;
        let tmp = output_dir.join(format!("{vm}.tmp"));
        let reader = ctx.ui.track_progress(&ova.name, download.size, download.reader);
        let written = copy_to_file(reader, &tmp, cancel).await?;

        if let Some(expected) = download.size.filter(|s| *s > 0) {
            if written != expected {
                tokio::fs::remove_file(&tmp).await?;
                return Err(BuildError::SizeMismatch {
                    path: tmp,
                    expected,
                    actual: written,
                });
            }
        }

        let path = output_dir.join(format!("{}.{}", ova.name, format.extension()));
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(ova = %ova.name, path = %path.display(), bytes = written, "OVA exported");
        ctx.ui.message(&format!("Saved {}", path.display()));
        state.exported_files.push(path);
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, OvaConfig};
    use crate::steps::testing::{add_vm, config, context, fake, VM};

    fn state() -> BuildState {
        BuildState {
            vm_ext_id: Some(VM.into()),
            ..Default::default()
        }
    }

    fn ova_config(format: &str, dir: &std::path::Path) -> BuildConfig {
        let mut config = BuildConfig {
            ova: OvaConfig {
                create: true,
                export: true,
                format: format.into(),
                name: String::new(),
            },
            output_dir: dir.to_path_buf(),
            ..config()
        };
        config.ova.name = config.vm.image_name.clone();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_export_ova() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake();
        add_vm(&fake, &[100]);
        let ctx = context(&fake, ova_config("qcow2", dir.path()));
        let mut state = state();

        CreateOvaStep.run(&ctx, &mut state).await.unwrap();
        ExportOvaStep.run(&ctx, &mut state).await.unwrap();

        let path = dir.path().join("golden.qcow2");
        assert_eq!(state.exported_files, vec![path.clone()]);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("ova golden QCOW2 {VM}"));
        assert!(!dir.path().join(format!("{VM}.tmp")).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_format_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake();
        add_vm(&fake, &[100]);
        let ctx = context(&fake, ova_config("vhdx", dir.path()));
        let mut state = state();

        CreateOvaStep.run(&ctx, &mut state).await.unwrap();
        ExportOvaStep.run(&ctx, &mut state).await.unwrap();

        assert_eq!(fake.calls("export_ova"), 0);
        assert_eq!(fake.calls("list_ovas"), 0);
        assert!(state.exported_files.is_empty());
    }
}
