//! Machine config templates and their validation gates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::render::{missing_required, render, RenderError, Substitutions};
use super::validator::ConfigValidator;

/// Named, versioned Talos machine config with `${...}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfigTemplate {
    /// Unique name.
    pub name: String,
    /// Incremented on every save.
    #[serde(default)]
    pub version: i32,
    /// YAML body with placeholders.
    pub body: String,
    /// Default install disk.
    pub install_disk: String,
    /// Installer image reference.
    pub install_image: String,
    /// Kubernetes version deployed by this config.
    pub kubernetes_version: String,
}

impl MachineConfigTemplate {
    /// A new, unsaved template.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        body: impl Into<String>,
        install_disk: impl Into<String>,
        install_image: impl Into<String>,
        kubernetes_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: 0,
            body: body.into(),
            install_disk: install_disk.into(),
            install_image: install_image.into(),
            kubernetes_version: kubernetes_version.into(),
        }
    }

    /// Render for the given values.
    ///
    /// # Errors
    /// Returns an error if a placeholder has no value.
    pub fn render(&self, vars: &Substitutions) -> Result<String, RenderError> {
        render(&self.body, vars)
    }
}

/// Reasons a template is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A required attribute is empty.
    #[error("{0} can't be blank")]
    Blank(&'static str),

    /// The body is not valid YAML; parser message verbatim.
    #[error("{0}")]
    Syntax(String),

    /// Required placeholders are absent.
    #[error("must include substitution variables {}", .0.join(" and "))]
    MissingPlaceholders(Vec<String>),

    /// Rendering with synthetic values failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The installer validator rejected the rendered document; output verbatim.
    #[error("{0}")]
    Rejected(String),
}

/// Run every validation gate, stopping at the first failure.
///
/// Gates: required attributes, YAML syntax, required placeholders, then the
/// installer validator on a rendering with synthetic server values.
///
/// # Errors
/// Returns the first gate that failed.
pub async fn validate_template(
    template: &MachineConfigTemplate,
    validator: &dyn ConfigValidator,
) -> Result<(), TemplateError> {
    for (field, value) in [
        ("name", &template.name),
        ("install_disk", &template.install_disk),
        ("install_image", &template.install_image),
        ("kubernetes_version", &template.kubernetes_version),
    ] {
        if value.trim().is_empty() {
            return Err(TemplateError::Blank(field));
        }
    }

    serde_yaml::from_str::<serde_yaml::Value>(&template.body)
        .map_err(|e| TemplateError::Syntax(e.to_string()))?;

    let missing = missing_required(&template.body);
    if !missing.is_empty() {
        return Err(TemplateError::MissingPlaceholders(missing));
    }

    let document = template.render(&Substitutions::synthetic(template))?;
    debug!(template = %template.name, "Validating rendered template");

    validator
        .validate(&document)
        .await
        .map_err(|d| TemplateError::Rejected(d.0))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::machine_config::Diagnostics;

    /// Records every document it sees and answers with a fixed verdict.
    struct FakeValidator {
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<String>>,
        verdict: Result<(), Diagnostics>,
    }

    impl FakeValidator {
        fn new(verdict: Result<(), Diagnostics>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last: std::sync::Mutex::new(None),
                verdict,
            }
        }
    }

    #[async_trait]
    impl ConfigValidator for FakeValidator {
        async fn validate(&self, document: &str) -> Result<(), Diagnostics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(document.to_string());
            self.verdict.clone()
        }
    }

    fn template(body: &str) -> MachineConfigTemplate {
        MachineConfigTemplate::new(
            "workers",
            body,
            "/dev/sda",
            "factory.talos.dev/installer/abc:v1.9.0",
            "1.32.0",
        )
    }

    const GOOD: &str = "machine:\n  type: worker\n  network:\n    hostname: ${hostname}\n    interfaces:\n      - addresses:\n          - ${private_ip}/24\n";

    #[tokio::test]
    async fn test_valid_template_is_rendered_with_synthetic_values() {
        let validator = FakeValidator::new(Ok(()));
        validate_template(&template(GOOD), &validator).await.unwrap();

        let seen = validator.last.lock().unwrap().clone().unwrap();
        assert!(seen.contains("hostname: worker-1"));
        assert!(seen.contains("10.0.1.1/24"));
    }

    #[tokio::test]
    async fn test_missing_private_ip_fails_before_validator() {
        let validator = FakeValidator::new(Ok(()));
        let err = validate_template(&template("machine:\n  hostname: ${hostname}\n"), &validator)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "must include substitution variables ${private_ip}"
        );
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_syntax_error_fails_before_substitution() {
        let validator = FakeValidator::new(Ok(()));
        let err = validate_template(&template("machine: [unclosed\n  ${hostname}"), &validator)
            .await
            .unwrap_err();

        assert!(matches!(err, TemplateError::Syntax(_)));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejection_keeps_diagnostics_verbatim() {
        let output = "3 errors occurred:\n\t* cluster instructions are required\n\t* install instructions are required in \"metal\" mode\n";
        let validator = FakeValidator::new(Err(Diagnostics(output.to_string())));

        let err = validate_template(&template(GOOD), &validator)
            .await
            .unwrap_err();
        assert_eq!(err, TemplateError::Rejected(output.to_string()));
        assert_eq!(err.to_string(), output);
    }

    #[tokio::test]
    async fn test_blank_attributes_are_rejected() {
        let validator = FakeValidator::new(Ok(()));
        let mut t = template(GOOD);
        t.kubernetes_version = "  ".into();

        let err = validate_template(&t, &validator).await.unwrap_err();
        assert_eq!(err, TemplateError::Blank("kubernetes_version"));
    }

    #[tokio::test]
    async fn test_unknown_placeholder_is_a_render_error() {
        let validator = FakeValidator::new(Ok(()));
        let body = format!("{GOOD}  zone: ${{zone}}\n");
        let err = validate_template(&template(&body), &validator)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TemplateError::Render(RenderError::UndefinedVariables(vec!["zone".into()]))
        );
    }
}
