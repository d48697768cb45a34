//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::LodestoneConfig;

/// Name of the git-tracked project config file.
const PROJECT_CONFIG: &str = "lodestone.toml";

/// Name of the gitignored local override file.
const LOCAL_CONFIG: &str = "lodestone.local.toml";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "LODE".to_string(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "LODE")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<LodestoneConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = LodestoneConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Project config (lodestone.toml)
        let project_config_file = self.project_dir.join(PROJECT_CONFIG);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Local config (lodestone.local.toml, gitignored)
        let local_config_file = self.project_dir.join(LOCAL_CONFIG);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Environment variables (LODE_*)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .context("failed to merge configuration sources")?;

        let config: LodestoneConfig = merged
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config
            .validate()
            .context("configuration failed validation")?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
