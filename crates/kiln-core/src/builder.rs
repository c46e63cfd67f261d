//! Pipeline assembly and the build entry point.

use crate::artifact::BuildReport;
use crate::collab::{Communicator, ConsoleTransport, TracingUi, Ui};
use crate::config::{BuildConfig, CommunicatorType};
use crate::pipeline::Pipeline;
use crate::state::BuildState;
use crate::step::StepContext;
use crate::steps::{
    BootCommandStep, CleanVmStep, ConsoleConnectStep, CreateImageStep, CreateOvaStep,
    CreateTemplateStep, CreateVmStep, ExportImageStep, ExportOvaStep, PowerOnStep, ProvisionStep,
    ShutdownStep, WaitForIpStep,
};
use kiln_prism::Driver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds one image from a [`BuildConfig`].
pub struct ImageBuilder {
    config: Arc<BuildConfig>,
    driver: Arc<dyn Driver>,
    ui: Arc<dyn Ui>,
    communicator: Option<Arc<dyn Communicator>>,
    console: Option<Arc<dyn ConsoleTransport>>,
    cleanup_cancel: CancellationToken,
}

impl ImageBuilder {
    pub fn new(mut config: BuildConfig, driver: Arc<dyn Driver>) -> Self {
        config.apply_defaults();
        Self {
            config: Arc::new(config),
            driver,
            ui: Arc::new(TracingUi),
            communicator: None,
            console: None,
            cleanup_cancel: CancellationToken::new(),
        }
    }

    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    /// Remote command channel used for provisioning and shutdown.
    pub fn with_communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Console transport used to type the boot command.
    pub fn with_console(mut self, console: Arc<dyn ConsoleTransport>) -> Self {
        self.console = Some(console);
        self
    }

    /// Token that abandons cleanup once the build was interrupted.
    pub fn with_cleanup_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cleanup_cancel = cancel;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Steps this build runs, in order.
    pub fn pipeline(&self) -> Pipeline {
        let config = &self.config;
        let mut pipeline = Pipeline::new();

        pipeline.push(CreateVmStep);
        pipeline.push(PowerOnStep);
        if !config.boot_command.is_empty() && !config.disable_vnc {
            pipeline.push(ConsoleConnectStep);
            pipeline.push(BootCommandStep);
        }
        pipeline.push(WaitForIpStep);
        if config.communicator != CommunicatorType::None {
            pipeline.push(ProvisionStep);
        }
        pipeline.push(ShutdownStep);
        if config.clean.any() {
            pipeline.push(CleanVmStep);
        }
        if !config.image_skip {
            pipeline.push(CreateImageStep);
        }
        if config.ova.create {
            pipeline.push(CreateOvaStep);
        }
        if config.ova.export {
            pipeline.push(ExportOvaStep);
        }
        if config.image_export && !config.image_skip {
            pipeline.push(ExportImageStep);
        }
        if config.template.create {
            pipeline.push(CreateTemplateStep);
        }
        pipeline
    }

    /// Run the build until it completes, fails or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> BuildReport {
        let ctx = StepContext {
            driver: Arc::clone(&self.driver),
            config: Arc::clone(&self.config),
            ui: Arc::clone(&self.ui),
            communicator: self.communicator.clone(),
            console: self.console.clone(),
            cancel,
            cleanup_cancel: self.cleanup_cancel.clone(),
        };
        let pipeline = self.pipeline();
        tracing::info!(
            vm = %self.config.vm.vm_name,
            image = %self.config.vm.image_name,
            steps = ?pipeline.names(),
            "Starting build"
        );

        let mut state = BuildState::new();
        pipeline.run(&ctx, &mut state).await;

        let report = BuildReport::from_state(&self.config.vm.image_name, state);
        match (&report.artifact, &report.error) {
            (Some(artifact), _) => self.ui.say(&format!("Build finished: {artifact}")),
            (None, Some(e)) if report.cancelled => self.ui.say(&format!("Build cancelled: {e}")),
            (None, _) if report.cancelled => self.ui.say("Build cancelled"),
            (None, Some(e)) => self.ui.error(&format!("Build failed: {e}")),
            (None, None) => self.ui.error("Build halted"),
        }
        for action in &report.actions {
            self.ui.message(&action.to_string());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanConfig, OvaConfig, TemplateConfig};
    use kiln_prism::{FakePrism, PrismDriver};

    fn builder(config: BuildConfig) -> ImageBuilder {
        ImageBuilder::new(config, Arc::new(PrismDriver::new(Arc::new(FakePrism::new()))))
    }

    #[test]
    fn test_minimal_pipeline() {
        let builder = builder(BuildConfig {
            communicator: CommunicatorType::None,
            ..Default::default()
        });
        assert_eq!(
            builder.pipeline().names(),
            vec!["create_vm", "power_on", "wait_for_ip", "shutdown", "create_image"]
        );
    }

    #[test]
    fn test_full_pipeline_order() {
        let builder = builder(BuildConfig {
            boot_command: vec!["<enter>".into()],
            clean: CleanConfig {
                cdrom: true,
                guest_customization: false,
            },
            ova: OvaConfig {
                create: true,
                export: true,
                ..Default::default()
            },
            image_export: true,
            template: TemplateConfig {
                create: true,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(
            builder.pipeline().names(),
            vec![
                "create_vm",
                "power_on",
                "console_connect",
                "boot_command",
                "wait_for_ip",
                "provision",
                "shutdown",
                "clean_vm",
                "create_image",
                "create_ova",
                "export_ova",
                "export_image",
                "create_template",
            ]
        );
    }

    #[test]
    fn test_skip_image_and_vnc() {
        let builder = builder(BuildConfig {
            boot_command: vec!["<enter>".into()],
            disable_vnc: true,
            image_skip: true,
            image_export: true,
            communicator: CommunicatorType::None,
            ..Default::default()
        });
        let names = builder.pipeline().names();
        assert!(!names.contains(&"console_connect"));
        assert!(!names.contains(&"create_image"));
        assert!(!names.contains(&"export_image"));
    }

    #[test]
    fn test_defaults_applied() {
        let builder = builder(BuildConfig::default());
        assert!(builder.config().vm.vm_name.starts_with("kiln-"));
        assert_eq!(builder.config().vm.image_name, builder.config().vm.vm_name);
    }
}
