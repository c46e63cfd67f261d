use super::vm_id;
use crate::error::Result;
use crate::state::BuildState;
use crate::step::{Step, StepAction, StepContext};
use async_trait::async_trait;

/// Create a VM template from the built VM.
pub struct CreateTemplateStep;

#[async_trait]
impl Step for CreateTemplateStep {
    fn name(&self) -> &'static str {
        "create_template"
    }

    async fn run(&self, ctx: &StepContext, state: &mut BuildState) -> Result<StepAction> {
        let vm = vm_id(state)?;
        let spec = ctx.config.template.spec();

        ctx.ui.say(&format!("Creating template {}...", spec.name));
        let ext_id = ctx.driver.create_template(&vm, &spec, &ctx.cancel).await?;
        ctx.ui.message(&format!("Template {} created ({ext_id})", spec.name));
        state.template_ext_id = Some(ext_id);
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, TemplateConfig};
    use crate::steps::testing::{add_vm, config, context, fake, VM};

    #[tokio::test(start_paused = true)]
    async fn test_template_created_from_vm() {
        let fake = fake();
        add_vm(&fake, &[100]);
        let ctx = context(
            &fake,
            BuildConfig {
                template: TemplateConfig {
                    create: true,
                    name: "golden-tmpl".into(),
                    description: Some("nightly".into()),
                },
                ..config()
            },
        );
        let mut state = BuildState {
            vm_ext_id: Some(VM.into()),
            ..Default::default()
        };

        CreateTemplateStep.run(&ctx, &mut state).await.unwrap();

        let templates = fake.templates();
        assert_eq!(templates.len(), 1);
        let (ext_id, vm, spec) = &templates[0];
        assert_eq!(vm, VM);
        assert_eq!(spec.name, "golden-tmpl");
        assert_eq!(spec.description.as_deref(), Some("nightly"));
        assert_eq!(state.template_ext_id.as_deref(), Some(ext_id.as_str()));
    }
}
