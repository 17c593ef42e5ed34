//! `[registry]` table: which storage backs the registry gateway.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Lost on restart. Meant for tests and demos.
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backend_path"))]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Database file, only read by the sqlite backend.
    pub path: PathBuf,
    /// Process the server creates at startup when none is active.
    pub bootstrap_process: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            backend: RegistryBackend::default(),
            path: PathBuf::from("/var/lib/greenbee/registry.db"),
            bootstrap_process: None,
        }
    }
}

fn validate_backend_path(config: &RegistryConfig) -> Result<(), ValidationError> {
    if config.backend == RegistryBackend::Sqlite && config.path.as_os_str().is_empty() {
        return Err(ValidationError::new("missing_registry_path")
            .with_message("The sqlite registry backend needs a path".into()));
    }
    if config
        .bootstrap_process
        .as_deref()
        .is_some_and(|name| name.trim().is_empty())
    {
        return Err(ValidationError::new("empty_bootstrap_process")
            .with_message("bootstrap_process must not be empty".into()));
    }
    Ok(())
}
