//! What a build leaves behind.

use crate::error::BuildError;
use crate::state::BuildState;
use std::fmt;
use std::path::PathBuf;

/// Result of a successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    /// Image name the build was asked for.
    pub name: String,
    /// Captured images; the first one identifies the artifact.
    pub image_ext_ids: Vec<String>,
    /// Files written to the output directory.
    pub files: Vec<PathBuf>,
    pub template_ext_id: Option<String>,
}

impl Artifact {
    pub(crate) fn from_state(name: &str, state: &BuildState) -> Self {
        Self {
            name: name.to_string(),
            image_ext_ids: state
                .produced_images
                .iter()
                .map(|i| i.ext_id.clone())
                .collect(),
            files: state.exported_files.clone(),
            template_ext_id: state.template_ext_id.clone(),
        }
    }

    /// Identifier of the artifact: the first image, else the first file.
    pub fn id(&self) -> Option<String> {
        self.image_ext_ids
            .first()
            .cloned()
            .or_else(|| self.files.first().map(|f| f.display().to_string()))
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.image_ext_ids.first() {
            Some(id) => write!(f, "{}: {}", self.name, id)?,
            None => write!(f, "{}", self.name)?,
        }
        for file in &self.files {
            write!(f, " [{}]", file.display())?;
        }
        if let Some(template) = &self.template_ext_id {
            write!(f, " template {template}")?;
        }
        Ok(())
    }
}

/// A compensating action taken while cleaning up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    VmDeleted(String),
    /// VM left in place, either on request or for debugging a failed build.
    VmRetained(String),
    ImageDeleted(String),
    ConsoleClosed,
    /// A cleanup call failed; the error is not escalated.
    Failed { target: String, error: String },
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmDeleted(id) => write!(f, "deleted vm {id}"),
            Self::VmRetained(id) => write!(f, "retained vm {id}"),
            Self::ImageDeleted(id) => write!(f, "deleted image {id}"),
            Self::ConsoleClosed => write!(f, "closed console"),
            Self::Failed { target, error } => write!(f, "failed to clean up {target}: {error}"),
        }
    }
}

/// Final outcome of a build.
#[derive(Debug)]
pub struct BuildReport {
    /// Set when every step completed.
    pub artifact: Option<Artifact>,
    /// First fatal error.
    pub error: Option<BuildError>,
    pub cancelled: bool,
    pub actions: Vec<CleanupAction>,
}

impl BuildReport {
    pub(crate) fn from_state(name: &str, mut state: BuildState) -> Self {
        let interrupted = state.interrupted();
        let error = state.error.take();
        Self {
            artifact: (!interrupted && error.is_none()).then(|| Artifact::from_state(name, &state)),
            error,
            cancelled: state.cancelled,
            actions: std::mem::take(&mut state.actions),
        }
    }

    pub fn is_success(&self) -> bool {
        self.artifact.is_some()
    }

    /// Convert into the artifact or the first fatal error.
    pub fn into_result(self) -> Result<Artifact, BuildError> {
        match (self.artifact, self.error) {
            (Some(artifact), _) => Ok(artifact),
            (None, Some(err)) => Err(err),
            (None, None) if self.cancelled => Err(BuildError::Cancelled),
            (None, None) => Err(BuildError::InvalidConfig("build halted".into())),
        }
    }
}
