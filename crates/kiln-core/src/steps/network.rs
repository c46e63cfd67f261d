use super::vm_id;
use crate::collab::connection_host;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;

/// Wait for the guest to report a stable address.
pub struct WaitForIpStep;

#[async_trait]
impl Step for WaitForIpStep {
    fn name(&self) -> &'static str {
        "wait_for_ip"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let vm = vm_id(state)?;
        if ctx.config.vm.nics.is_empty() {
            ctx.ui.message("VM has no NIC, not waiting for an address");
            return Ok(StepAction::Continue);
        }

        let ip_wait = ctx.config.ip_wait()?;
        ctx.ui.say(&format!(
            "Waiting up to {:?} for an IP address...",
            ip_wait.wait_timeout
        ));
        let ip = ctx.driver.wait_for_ip(&vm, &ip_wait, &ctx.cancel).await?;
        ctx.ui.message(&format!("IP address: {ip}"));
        state.ip = Some(ip);
        Ok(StepAction::Continue)
    }
}

/// Connect to the guest and run the provisioning commands in order.
pub struct ProvisionStep;

#[async_trait]
impl Step for ProvisionStep {
    fn name(&self) -> &'static str {
        "provision"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let Some(communicator) = &ctx.communicator else {
            ctx.ui.message("No communicator configured, skipping provisioning");
            return Ok(StepAction::Continue);
        };
        let cancel = &ctx.cancel;
        let host = connection_host(&ctx.config, state).to_string();

        ctx.ui.say(&format!("Connecting to {host}..."));
        communicator.connect(&host, cancel).await?;

        for command in &ctx.config.provision {
            ctx.ui.say(&format!("Provisioning with '{command}'"));
            let status = communicator.run_command(&host, command, cancel).await?;
            if status != 0 {
                return Err(BuildError::Communicator(format!(
                    "'{command}' exited with status {status}"
                )));
            }
        }
        Ok(StepAction::Continue)
    }
}
