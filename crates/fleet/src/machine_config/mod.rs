//! Talos machine config templates: rendering and validation.
//!
//! Templates are YAML documents containing `${hostname}` and `${private_ip}`
//! placeholders (plus optional `${install_disk}`, `${install_image}` and
//! `${kubernetes_version}`). A template is only persisted after passing
//! every gate in [`validate_template`]; rendering for a server is a pure
//! function of the template and the server's binding.

mod render;
mod template;
mod validator;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::model::ServerId;
use crate::store::{ServerStore, StoreError};

pub use render::{
    missing_required, placeholders, render, RenderError, Substitutions, REQUIRED_VARIABLES,
    SYNTHETIC_HOSTNAME, SYNTHETIC_PRIVATE_IP,
};
pub use template::{validate_template, MachineConfigTemplate, TemplateError};
pub use validator::{ConfigValidator, Diagnostics, TalosctlValidator, SUCCESS_MARKER};

/// Errors from template persistence and per-server rendering.
#[derive(Error, Debug)]
pub enum MachineConfigError {
    /// The template failed validation.
    #[error("Invalid machine config template: {0}")]
    Invalid(#[from] TemplateError),

    /// Rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates templates before saving and renders them for servers.
#[derive(Clone)]
pub struct TemplateService {
    store: Arc<dyn ServerStore>,
    validator: Arc<dyn ConfigValidator>,
}

impl std::fmt::Debug for TemplateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateService").finish_non_exhaustive()
    }
}

impl TemplateService {
    /// Create a service over `store` using `validator` for the installer gate.
    #[must_use]
    pub fn new(store: Arc<dyn ServerStore>, validator: Arc<dyn ConfigValidator>) -> Self {
        Self { store, validator }
    }

    /// Validate and persist a template.
    ///
    /// Nothing is written when any gate fails.
    ///
    /// # Errors
    /// Returns [`MachineConfigError::Invalid`] with the failing gate's
    /// message, or a store error.
    pub async fn save(
        &self,
        template: &MachineConfigTemplate,
    ) -> Result<MachineConfigTemplate, MachineConfigError> {
        if let Err(e) = validate_template(template, self.validator.as_ref()).await {
            warn!(template = %template.name, error = %e, "Rejected machine config template");
            return Err(e.into());
        }

        let saved = self.store.save_template(template).await?;
        info!(template = %saved.name, version = saved.version, "Saved machine config template");
        Ok(saved)
    }

    /// Render the machine config for one server from its bound template.
    ///
    /// # Errors
    /// Returns an error if the server is unbound, the template is missing,
    /// or a placeholder has no value.
    pub async fn render_for_server(&self, id: ServerId) -> Result<String, MachineConfigError> {
        let server = self.store.get_server(id).await?;
        let binding = server
            .machine_config
            .as_ref()
            .ok_or(RenderError::Unbound(id))?;
        let template = self.store.get_template(&binding.template).await?;

        let vars = Substitutions::for_server(&template, &server)?;
        Ok(template.render(&vars)?)
    }
}
