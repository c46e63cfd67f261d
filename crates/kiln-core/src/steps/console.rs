use super::{cleanup_failed, vm_id};
use crate::artifact::CleanupAction;
use crate::bootcmd::{self, BootAction};
use crate::error::{BuildError, Result};
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;
use kiln_prism::cancellable_sleep;

/// Open a console session for the boot command.
pub struct ConsoleConnectStep;

#[async_trait]
impl Step for ConsoleConnectStep {
    fn name(&self) -> &'static str {
        "console_connect"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let Some(transport) = &ctx.console else {
            ctx.ui
                .message("No console transport available, boot command will not be typed");
            return Ok(StepAction::Continue);
        };
        let vm = vm_id(state)?;

        ctx.ui.say("Connecting to VM console...");
        let access = ctx.driver.generate_console_access(&vm, &ctx.cancel).await?;
        let session = transport.connect(&access, &ctx.cancel).await?;
        state.console = Some(session);
        Ok(StepAction::Continue)
    }

    async fn cleanup(&self, ctx: &StepContext, state: &mut BuildState) {
        if let Some(mut session) = state.console.take() {
            match session.close().await {
                Ok(()) => state.record(CleanupAction::ConsoleClosed),
                Err(e) => cleanup_failed(ctx, state, "console".to_string(), e),
            }
        }
    }
}

/// Type the boot command into the open console.
pub struct BootCommandStep;

#[async_trait]
impl Step for BootCommandStep {
    fn name(&self) -> &'static str {
        "boot_command"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let config = &ctx.config;
        let cancel = &ctx.cancel;
        if state.console.is_none() {
            return Ok(StepAction::Continue);
        }
        let actions = bootcmd::parse(&config.boot_command)?;

        ctx.ui
            .say(&format!("Waiting {:?} for boot...", config.boot_wait));
        cancellable_sleep(cancel, config.boot_wait).await?;

        ctx.ui.say("Typing the boot command...");
        let session = state
            .console
            .as_mut()
            .ok_or(BuildError::MissingState("console"))?;
        for action in actions {
            match action {
                BootAction::Key(key) => {
                    session.send_key(key).await?;
                    cancellable_sleep(cancel, config.boot_key_interval).await?;
                }
                BootAction::Wait(pause) => cancellable_sleep(cancel, pause).await?,
            }
        }

        if let Some(mut session) = state.console.take() {
            session.close().await?;
        }
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootcmd::BootKey;
    use crate::collab::{ConsoleSession, ConsoleTransport};
    use crate::config::BuildConfig;
    use crate::steps::testing::{add_vm, config, context, fake, VM};
    use kiln_prism::ConsoleAccess;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Screen {
        urls: Vec<String>,
        keys: Vec<(Duration, BootKey)>,
        closed: usize,
    }

    struct FakeConsole {
        screen: Arc<Mutex<Screen>>,
    }

    struct FakeSession {
        screen: Arc<Mutex<Screen>>,
        start: Instant,
    }

    #[async_trait]
    impl ConsoleTransport for FakeConsole {
        async fn connect(
            &self,
            access: &ConsoleAccess,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn ConsoleSession>> {
            self.screen.lock().unwrap().urls.push(access.url.clone());
            Ok(Box::new(FakeSession {
                screen: self.screen.clone(),
                start: Instant::now(),
            }))
        }
    }

    #[async_trait]
    impl ConsoleSession for FakeSession {
        async fn send_key(&mut self, key: BootKey) -> Result<()> {
            let at = self.start.elapsed();
            self.screen.lock().unwrap().keys.push((at, key));
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.screen.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    fn console_context(config: BuildConfig) -> (StepContext, Arc<Mutex<Screen>>) {
        let fake = fake();
        add_vm(&fake, &[10]);
        let screen = Arc::new(Mutex::new(Screen::default()));
        let mut ctx = context(&fake, config);
        ctx.console = Some(Arc::new(FakeConsole {
            screen: screen.clone(),
        }));
        (ctx, screen)
    }

    fn state() -> BuildState {
        BuildState {
            vm_ext_id: Some(VM.into()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_command_typed_after_boot_wait() {
        let config = BuildConfig {
            boot_command: vec!["a<wait2s>b".into(), "<enter>".into()],
            boot_wait: Duration::from_secs(10),
            boot_key_interval: Duration::from_millis(100),
            ..config()
        };
        let (ctx, screen) = console_context(config);
        let mut state = state();

        ConsoleConnectStep.run(&ctx, &mut state).await.unwrap();
        BootCommandStep.run(&ctx, &mut state).await.unwrap();

        let screen = screen.lock().unwrap();
        assert!(screen.urls[0].contains("VmConsoleToken="));
        let ms = |n| Duration::from_millis(n);
        assert_eq!(
            screen.keys,
            vec![
                (ms(10_000), BootKey::Char('a')),
                (ms(12_100), BootKey::Char('b')),
                (ms(12_200), BootKey::Enter),
            ]
        );
        assert_eq!(screen.closed, 1);
        assert!(state.console.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_closes_open_session() {
        let (ctx, screen) = console_context(config());
        let mut state = state();

        ConsoleConnectStep.run(&ctx, &mut state).await.unwrap();
        ConsoleConnectStep.cleanup(&ctx.for_cleanup(), &mut state).await;

        assert_eq!(screen.lock().unwrap().closed, 1);
        assert_eq!(state.actions, vec![CleanupAction::ConsoleClosed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_wait_is_cancellable() {
        let config = BuildConfig {
            boot_command: vec!["x".into()],
            boot_wait: Duration::from_secs(600),
            ..config()
        };
        let (ctx, screen) = console_context(config);
        let mut state = state();
        ConsoleConnectStep.run(&ctx, &mut state).await.unwrap();

        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = BootCommandStep.run(&ctx, &mut state).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(screen.lock().unwrap().keys.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_transport_is_skipped() {
        let fake = fake();
        add_vm(&fake, &[10]);
        let ctx = context(&fake, config());
        let mut state = state();

        ConsoleConnectStep.run(&ctx, &mut state).await.unwrap();
        BootCommandStep.run(&ctx, &mut state).await.unwrap();

        assert_eq!(fake.calls("generate_console_token"), 0);
    }
}
