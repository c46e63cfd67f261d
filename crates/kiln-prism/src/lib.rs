//! # kiln-prism
//!
//! Resource driver for Nutanix Prism Central.
//!
//! This crate turns a declarative [`VmConfig`] into VMs and images on a
//! Prism Central instance and back again: it resolves named resources,
//! deduplicates images, polls asynchronous tasks, waits for guest IPs and
//! streams exported artifacts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      kiln-prism                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐                                     │
//! │  │  Driver         │  create / power / delete / export   │
//! │  │  (PrismDriver)  │                                     │
//! │  └─────────────────┘                                     │
//! │     │        │         │            │                    │
//! │     ▼        ▼         ▼            ▼                    │
//! │  Resolver  ImageLifecycle  VmSpecBuilder  IpAcquisition  │
//! │     │        │         │            │                    │
//! │     └────────┴────┬────┴────────────┘                    │
//! │                   ▼                                      │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │  TaskWaiter     │────▶│  dyn PrismApi            │    │
//! │  └─────────────────┘     │  PrismClient | FakePrism │    │
//! │                          └──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//!                              │ HTTPS (v4 REST)
//!                              ▼
//!                        Prism Central
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiln_prism::{ClientCache, Driver, PrismDriver, PrismEndpoint, VmConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(config: VmConfig) -> kiln_prism::Result<()> {
//! let cache = ClientCache::new();
//! let client = cache
//!     .get_or_create(&PrismEndpoint::new("pc.example.com", "admin", "secret"))
//!     .await?;
//! let driver = PrismDriver::new(client);
//! let cancel = CancellationToken::new();
//!
//! let prepared = driver.create_request(&config, &cancel).await?;
//! let vm = driver.create(&prepared.request, &cancel).await?;
//! driver.power_on(&vm.ext_id, &cancel).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod builder;
pub mod cache;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod image;
pub mod ip;
pub mod resolver;
pub mod task;
pub mod types;

// Re-exports for convenience
pub use api::PrismApi;
pub use builder::VmSpecBuilder;
pub use cache::ClientCache;
pub use client::PrismClient;
pub use config::{
    Category, DiskConfig, GpuConfig, NicConfig, OsType, PrismEndpoint, VmConfig, DEFAULT_PORT,
};
pub use driver::{Driver, PrismDriver};
pub use error::{PrismError, ResourceKind, Result};
#[cfg(any(test, feature = "fake"))]
pub use fake::FakePrism;
pub use image::{DedupPolicy, DiskExportOptions, ImageLifecycle, ReadinessPolicy};
pub use ip::{Cidr, IpAcquisition, IpWaitConfig};
pub use resolver::Resolver;
pub use task::{
    cancellable, cancellable_sleep, TaskWaiter, DEFAULT_POLL_INTERVAL, DEFAULT_TASK_TIMEOUT,
};
pub use types::*;
