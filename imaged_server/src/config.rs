//! Worker configuration: loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::services::packer::DEFAULT_GRACE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Local path of the template repository clone.
    pub templates_path: PathBuf,
    /// Remote URL the templates are cloned from when no clone exists yet.
    pub templates_url: Option<String>,
    /// Path to the Packer executable.
    pub packer_path: PathBuf,
    /// Secrets archive copied into the template checkout before each build.
    pub secrets_path: Option<PathBuf>,
    /// How long an interrupted Packer gets to clean up before it is killed.
    pub packer_grace: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let templates_path = var("IMAGED_TEMPLATES_PATH")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("IMAGED_TEMPLATES_PATH"))?;
        let templates_url = var("IMAGED_TEMPLATES_URL");
        let packer_path = var("IMAGED_PACKER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("packer"));
        let secrets_path = var("IMAGED_SECRETS_PATH").map(PathBuf::from);
        let packer_grace = match var("IMAGED_PACKER_GRACE_SECS") {
            Some(value) => value
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid {
                    name: "IMAGED_PACKER_GRACE_SECS",
                    value,
                })?,
            None => DEFAULT_GRACE,
        };

        if secrets_path.is_none() {
            tracing::warn!("IMAGED_SECRETS_PATH not set -- builds will run without secrets");
        }

        Ok(Self {
            templates_path,
            templates_url,
            packer_path,
            secrets_path,
            packer_grace,
        })
    }
}
