//! Shared state threaded through the build steps.

use crate::artifact::CleanupAction;
use crate::collab::ConsoleSession;
use crate::error::BuildError;
use std::path::PathBuf;

/// Image captured from one of the VM's disks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedImage {
    pub ext_id: String,
    pub name: String,
    pub size_bytes: u64,
}

/// Values produced by one step and consumed by later steps or by cleanup.
///
/// Steps run one at a time, so the store needs no locking.
#[derive(Default)]
pub struct BuildState {
    pub vm_ext_id: Option<String>,
    pub cluster_ext_id: Option<String>,
    /// Uploaded `cd_path` image, always deleted in cleanup.
    pub cd_image: Option<String>,
    /// Images uploaded from local files.
    pub uploaded_images: Vec<String>,
    /// Source images marked for deletion when the build ends.
    pub images_to_delete: Vec<String>,
    /// Stable guest address.
    pub ip: Option<String>,
    pub console: Option<Box<dyn ConsoleSession>>,
    pub produced_images: Vec<ProducedImage>,
    pub exported_files: Vec<PathBuf>,
    pub template_ext_id: Option<String>,

    /// First fatal error.
    pub error: Option<BuildError>,
    pub cancelled: bool,
    pub halted: bool,
    /// Compensating actions taken during cleanup.
    pub actions: Vec<CleanupAction>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the build stopped before completing every step.
    pub fn interrupted(&self) -> bool {
        self.cancelled || self.halted
    }

    /// Mark an image for deletion at the end of the build, once.
    pub fn delete_later(&mut self, ext_id: impl Into<String>) {
        let ext_id = ext_id.into();
        if !self.images_to_delete.contains(&ext_id) {
            self.images_to_delete.push(ext_id);
        }
    }

    pub(crate) fn record(&mut self, action: CleanupAction) {
        tracing::debug!(action = %action, "Cleanup action");
        self.actions.push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_later_dedupes() {
        let mut state = BuildState::new();
        state.delete_later("img-1");
        state.delete_later("img-1");
        state.delete_later("img-2");
        assert_eq!(state.images_to_delete, vec!["img-1", "img-2"]);
    }

    #[test]
    fn test_interrupted() {
        let mut state = BuildState::new();
        assert!(!state.interrupted());
        state.halted = true;
        assert!(state.interrupted());
    }
}
