//! Sequential step runner and cleanup cascade.

use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};

/// Ordered list of build steps.
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl Step + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, then clean up.
    ///
    /// The first error, halt or cancellation stops the run. Every step that
    /// was entered, including the one that failed, is then cleaned up in
    /// reverse order.
    pub async fn run(&self, ctx: &StepContext, state: &mut BuildState) {
        let mut entered = 0;

        for step in &self.steps {
            if ctx.cancel.is_cancelled() {
                tracing::info!(step = step.name(), "Build cancelled, skipping remaining steps");
                state.cancelled = true;
                break;
            }

            entered += 1;
            tracing::debug!(step = step.name(), "Running step");
            match step.run(ctx, state).await {
                Ok(StepAction::Continue) => {}
                Ok(StepAction::Halt) => {
                    tracing::info!(step = step.name(), "Step halted the build");
                    state.halted = true;
                    break;
                }
                Err(e) if e.is_cancelled() || ctx.cancel.is_cancelled() => {
                    tracing::info!(step = step.name(), error = %e, "Step interrupted");
                    state.cancelled = true;
                    state.error = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::error!(step = step.name(), error = %e, "Step failed");
                    ctx.ui.error(&format!("{}: {e}", step.name()));
                    state.halted = true;
                    state.error = Some(e);
                    break;
                }
            }
        }

        let cleanup = ctx.for_cleanup();
        for step in self.steps[..entered].iter().rev() {
            tracing::debug!(step = step.name(), "Cleaning up step");
            step.cleanup(&cleanup, state).await;
        }
    }
}
