//! The step abstraction and the context shared by every step.

use crate::collab::{Communicator, ConsoleTransport, Ui};
use crate::config::BuildConfig;
use crate::error::Result;
use crate::state::BuildState;
use async_trait::async_trait;
use kiln_prism::Driver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the pipeline does after a step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Stop the pipeline and clean up.
    Halt,
}

/// One stage of a build.
///
/// `cleanup` runs for every step whose `run` was entered, in reverse order,
/// whatever the outcome. It must not fail: errors are logged and recorded
/// as [`CleanupAction::Failed`](crate::artifact::CleanupAction::Failed).
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction>;

    async fn cleanup(&self, _ctx: &StepContext, _state: &mut BuildState) {}
}

/// Collaborators and settings available to every step.
#[derive(Clone)]
pub struct StepContext {
    pub driver: Arc<dyn Driver>,
    pub config: Arc<BuildConfig>,
    pub ui: Arc<dyn Ui>,
    pub communicator: Option<Arc<dyn Communicator>>,
    pub console: Option<Arc<dyn ConsoleTransport>>,
    /// Fires when the build is interrupted.
    pub cancel: CancellationToken,
    /// Abandons the cleanup phase, e.g. on a second interrupt.
    pub cleanup_cancel: CancellationToken,
}

impl StepContext {
    /// Context for the cleanup phase.
    ///
    /// Compensating calls must still reach the control plane after the
    /// build token fired, so cleanup runs under `cleanup_cancel` instead.
    pub fn for_cleanup(&self) -> Self {
        Self {
            cancel: self.cleanup_cancel.clone(),
            ..self.clone()
        }
    }
}
