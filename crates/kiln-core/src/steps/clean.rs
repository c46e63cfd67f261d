use super::vm_id;
use crate::error::Result;
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;
use kiln_prism::VmUpdate;

/// Strip install-time devices and data from the stopped VM.
pub struct CleanVmStep;

#[async_trait]
impl Step for CleanVmStep {
    fn name(&self) -> &'static str {
        "clean_vm"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let clean = ctx.config.clean;
        let vm = vm_id(state)?;

        if clean.cdrom {
            ctx.ui.say("Removing CD-ROMs...");
            let removed = ctx.driver.clean_removable_media(&vm, &ctx.cancel).await?;
            ctx.ui.message(&format!("{removed} CD-ROM(s) removed"));
        }

        if clean.guest_customization {
            ctx.ui.say("Removing guest customization...");
            let update = VmUpdate {
                clear_guest_customization: true,
                ..Default::default()
            };
            ctx.driver.update(&vm, &update, &ctx.cancel).await?;
        }
        Ok(StepAction::Continue)
    }
}
