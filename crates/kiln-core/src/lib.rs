//! # kiln-core
//!
//! Build orchestration for kiln.
//!
//! A build is a fixed sequence of steps run against one Prism Central VM:
//! create it, boot it, reach it, stop it, then capture its disks as images
//! and optionally an OVA or a template. When the run stops, for any reason,
//! every step that ran gets to clean up after itself in reverse order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       kiln-core                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  ImageBuilder   │────▶│  Pipeline                │    │
//! │  │  - pipeline()   │     │  create_vm → power_on →  │    │
//! │  │  - run()        │     │  ... → create_template   │    │
//! │  └─────────────────┘     └──────────────────────────┘    │
//! │           │                       │ run / cleanup        │
//! │           ▼                       ▼                      │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  BuildReport    │◀────│  BuildState              │    │
//! │  │  artifact,      │     │  vm, images, ip, files   │    │
//! │  │  cleanup actions│     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │                                                          │
//! │  StepContext: dyn Driver · dyn Ui · dyn Communicator ·   │
//! │               dyn ConsoleTransport · CancellationToken   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiln_core::{BuildConfig, ImageBuilder};
//! use kiln_prism::PrismDriver;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(driver: PrismDriver, json: &str) -> kiln_core::Result<()> {
//! let config = BuildConfig::from_json(json)?;
//! config.validate()?;
//!
//! let report = ImageBuilder::new(config, Arc::new(driver))
//!     .run(CancellationToken::new())
//!     .await;
//! let artifact = report.into_result()?;
//! println!("built {artifact}");
//! # Ok(())
//! # }
//! ```

mod artifact;
pub mod bootcmd;
mod builder;
mod collab;
mod config;
mod error;
mod pipeline;
mod state;
mod step;
pub mod steps;
mod transfer;

pub use artifact::{Artifact, BuildReport, CleanupAction};
pub use bootcmd::{BootAction, BootKey};
pub use builder::ImageBuilder;
pub use collab::{
    connection_host, BoxReader, Communicator, ConsoleSession, ConsoleTransport, ProgressReader,
    TracingUi, Ui,
};
pub use config::{
    BuildConfig, BuildConfigBuilder, CleanConfig, CommunicatorType, OvaConfig, TemplateConfig,
    DEFAULT_IMAGE_DESCRIPTION, MIN_TASK_POLL_INTERVAL,
};
pub use error::{BuildError, Result};
pub use pipeline::Pipeline;
pub use state::{BuildState, ProducedImage};
pub use step::{Step, StepAction, StepContext};
pub use transfer::copy_to_file;
