//! kiln entry point.
//!
//! Reads connection settings from the environment and the build description
//! from `KILN_BUILD_FILE`, runs one build against Prism Central and prints
//! the resulting artifact. Ctrl-C interrupts the build; steps that already
//! ran still clean up before the process exits. A second Ctrl-C abandons
//! that cleanup.

mod config;
mod ssh;

use anyhow::Context;
use config::KilnConfig;
use kiln_core::{BuildConfig, CommunicatorType, ImageBuilder};
use kiln_prism::{ClientCache, PrismDriver};
use ssh::SshCommunicator;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout carries the artifact summary.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("kiln=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = KilnConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();
    config.validate()?;

    let json = tokio::fs::read_to_string(&config.build_file)
        .await
        .with_context(|| format!("failed to read {}", config.build_file.display()))?;
    let mut build = BuildConfig::from_json(&json)
        .with_context(|| format!("invalid build file {}", config.build_file.display()))?;
    build.output_dir = config.output_dir.clone();
    build.validate()?;

    let cache = ClientCache::new();
    let client = cache.get_or_create(&config.endpoint()).await?;
    let driver = PrismDriver::new(client).with_waiter(build.task_waiter());

    let cancel = CancellationToken::new();
    let cleanup_cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let abandon = cleanup_cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt, stopping build...");
            interrupt.cancel();
        }
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received second interrupt, abandoning cleanup");
            abandon.cancel();
        }
    });

    let mut builder =
        ImageBuilder::new(build, Arc::new(driver)).with_cleanup_cancel(cleanup_cancel);
    if builder.config().communicator == CommunicatorType::Ssh {
        let ssh = SshCommunicator::new(&config.ssh_user).with_key(config.ssh_key.clone());
        builder = builder.with_communicator(Arc::new(ssh));
    }

    let report = builder.run(cancel).await;
    cache.teardown().await;

    let artifact = report.into_result()?;
    println!("{artifact}");
    Ok(())
}
