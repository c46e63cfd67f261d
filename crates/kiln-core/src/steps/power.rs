use super::vm_id;
use crate::collab::connection_host;
use crate::config::CommunicatorType;
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;
use kiln_prism::{cancellable_sleep, PowerState};
use std::time::Duration;
use tokio::time::Instant;

/// Interval between power state checks while shutting down.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(15);

pub struct PowerOnStep;

#[async_trait]
impl Step for PowerOnStep {
    fn name(&self) -> &'static str {
        "power_on"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let vm = vm_id(state)?;
        ctx.ui.say("Powering on VM...");
        ctx.driver.power_on(&vm, &ctx.cancel).await?;
        Ok(StepAction::Continue)
    }
}

/// Stop the guest and wait for the VM to report OFF.
///
/// With a communicator and a shutdown command the guest shuts itself down;
/// otherwise the VM is powered off.
pub struct ShutdownStep;

#[async_trait]
impl Step for ShutdownStep {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let config = &ctx.config;
        let cancel = &ctx.cancel;
        let vm = vm_id(state)?;

        match (&ctx.communicator, &config.shutdown_command) {
            (Some(communicator), Some(command)) if config.communicator == CommunicatorType::Ssh => {
                ctx.ui.say("Sending shutdown command...");
                let host = connection_host(config, state).to_string();
                let status = communicator.run_command(&host, command, cancel).await?;
                // The session usually drops while the guest goes down.
                tracing::debug!(vm = %vm, status, "Shutdown command returned");
            }
            _ => {
                ctx.ui.say("Powering off VM...");
                ctx.driver.power_off(&vm, cancel).await?;
            }
        }

        let deadline = Instant::now() + config.shutdown_timeout;
        loop {
            let current = ctx.driver.get_vm(&vm, cancel).await?;
            if current.power_state == PowerState::Off {
                break;
            }
            if Instant::now() >= deadline {
                return Err(BuildError::ShutdownTimeout(config.shutdown_timeout));
            }
            tracing::debug!(vm = %vm, power_state = %current.power_state, "Waiting for VM to stop");
            cancellable_sleep(cancel, SHUTDOWN_POLL_INTERVAL).await?;
        }

        ctx.ui.message("VM stopped");
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Communicator;
    use crate::config::BuildConfig;
    use crate::steps::testing::{add_vm, config, context, fake, VM};
    use kiln_prism::PrismError;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn state() -> BuildState {
        BuildState {
            vm_ext_id: Some(VM.into()),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingCommunicator {
        commands: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Communicator for RecordingCommunicator {
        async fn connect(&self, _host: &str, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn run_command(&self, host: &str, command: &str, _cancel: &CancellationToken) -> Result<i32> {
            self.commands
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_string()));
            Ok(255)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on() {
        let fake = fake();
        add_vm(&fake, &[10]);
        let ctx = context(&fake, config());

        PowerOnStep.run(&ctx, &mut state()).await.unwrap();

        assert_eq!(fake.vm(VM).unwrap().power_state, PowerState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_needs_vm() {
        let fake = fake();
        let ctx = context(&fake, config());

        let err = PowerOnStep
            .run(&ctx, &mut BuildState::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::MissingState("vm")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_communicator_powers_off() {
        let fake = fake();
        add_vm(&fake, &[10]);
        fake.set_power_state(VM, PowerState::On);
        let ctx = context(&fake, config());

        ShutdownStep.run(&ctx, &mut state()).await.unwrap();

        assert_eq!(fake.calls("power_off_vm"), 1);
        assert_eq!(fake.vm(VM).unwrap().power_state, PowerState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_command_then_poll_until_off() {
        let fake = fake();
        add_vm(&fake, &[10]);
        fake.set_power_state(VM, PowerState::On);
        let communicator = Arc::new(RecordingCommunicator::default());
        let mut ctx = context(
            &fake,
            BuildConfig {
                communicator: CommunicatorType::Ssh,
                shutdown_command: Some("shutdown -P now".into()),
                ..config()
            },
        );
        ctx.communicator = Some(communicator.clone());

        let guest = fake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            guest.set_power_state(VM, PowerState::Off);
        });

        let mut state = state();
        state.ip = Some("10.0.0.5".into());
        let start = Instant::now();
        ShutdownStep.run(&ctx, &mut state).await.unwrap();

        assert_eq!(
            *communicator.commands.lock().unwrap(),
            vec![("10.0.0.5".to_string(), "shutdown -P now".to_string())]
        );
        assert_eq!(fake.calls("power_off_vm"), 0);
        // Polls at 0s, 15s, 30s and 45s.
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout() {
        let fake = fake();
        add_vm(&fake, &[10]);
        fake.set_power_state(VM, PowerState::On);
        fake.fail_task("power_off_vm", "guest refused");
        let ctx = context(&fake, config());

        let err = ShutdownStep.run(&ctx, &mut state()).await.unwrap_err();
        assert!(matches!(err, BuildError::Prism(PrismError::TaskFailed { .. })));

        let ctx = context(
            &fake,
            BuildConfig {
                shutdown_timeout: Duration::from_secs(30),
                communicator: CommunicatorType::Ssh,
                shutdown_command: Some("halt".into()),
                ..config()
            },
        );
        let ctx = StepContext {
            communicator: Some(Arc::new(RecordingCommunicator::default())),
            ..ctx
        };
        let err = ShutdownStep.run(&ctx, &mut state()).await.unwrap_err();
        assert!(matches!(err, BuildError::ShutdownTimeout(_)));
    }
}
