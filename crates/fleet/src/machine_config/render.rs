//! Placeholder substitution for machine config templates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;

use super::MachineConfigTemplate;
use crate::model::{Server, ServerId};

/// Matches `${name}` placeholders.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Placeholders every template must contain.
pub const REQUIRED_VARIABLES: [&str; 2] = ["hostname", "private_ip"];

/// Hostname used when rendering a template for validation.
pub const SYNTHETIC_HOSTNAME: &str = "worker-1";

/// Private IP used when rendering a template for validation.
pub const SYNTHETIC_PRIVATE_IP: &str = "10.0.1.1";

/// Errors raised while rendering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The body references variables that have no value.
    #[error("undefined substitution variables: {}", .0.join(", "))]
    UndefinedVariables(Vec<String>),

    /// The server has no machine config binding.
    #[error("server {0} has no machine config assigned")]
    Unbound(ServerId),
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions(BTreeMap<String, String>);

impl Substitutions {
    /// Empty substitution set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a variable.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Value of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Template-level variables shared by every server.
    fn template_defaults(template: &MachineConfigTemplate) -> Self {
        Self::new()
            .with("install_disk", &template.install_disk)
            .with("install_image", &template.install_image)
            .with("kubernetes_version", &template.kubernetes_version)
    }

    /// Variables for one server bound to `template`.
    ///
    /// The server's selected bootstrap disk overrides the template's
    /// install disk.
    ///
    /// # Errors
    /// Returns [`RenderError::Unbound`] if the server has no binding.
    pub fn for_server(
        template: &MachineConfigTemplate,
        server: &Server,
    ) -> Result<Self, RenderError> {
        let binding = server
            .machine_config
            .as_ref()
            .ok_or(RenderError::Unbound(server.id))?;

        let mut vars = Self::template_defaults(template)
            .with("hostname", &binding.hostname)
            .with("private_ip", &binding.private_ip);
        if let Some(disk) = &server.bootstrap_disk {
            vars = vars.with("install_disk", disk);
        }
        Ok(vars)
    }

    /// Fixed fake server values used for validation.
    #[must_use]
    pub fn synthetic(template: &MachineConfigTemplate) -> Self {
        Self::template_defaults(template)
            .with("hostname", SYNTHETIC_HOSTNAME)
            .with("private_ip", SYNTHETIC_PRIVATE_IP)
    }
}

/// Names of all placeholders in `body`, in order of first appearance.
#[must_use]
pub fn placeholders(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(body) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Required placeholders missing from `body`, as `${name}` tokens.
#[must_use]
pub fn missing_required(body: &str) -> Vec<String> {
    REQUIRED_VARIABLES
        .iter()
        .map(|name| format!("${{{name}}}"))
        .filter(|token| !body.contains(token.as_str()))
        .collect()
}

/// Substitute every `${name}` in `body`.
///
/// # Errors
/// Returns [`RenderError::UndefinedVariables`] naming every placeholder
/// without a value; nothing is partially rendered.
pub fn render(body: &str, vars: &Substitutions) -> Result<String, RenderError> {
    let undefined: Vec<String> = placeholders(body)
        .into_iter()
        .filter(|name| vars.get(name).is_none())
        .collect();
    if !undefined.is_empty() {
        return Err(RenderError::UndefinedVariables(undefined));
    }

    Ok(PLACEHOLDER
        .replace_all(body, |caps: &Captures<'_>| {
            vars.get(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned())
}
