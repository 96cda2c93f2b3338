//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use crate::{project_config_file, ConfigError, LodestoneConfig};

/// Merges configuration sources with env > project file > defaults
/// precedence.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Creates a loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "LODESTONE".to_string(),
        }
    }

    /// Sets the project directory searched for `lodestone.toml`.
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default `LODESTONE`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<LodestoneConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults.
        let defaults = LodestoneConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Project config (lodestone.toml).
        let project_file = project_config_file(&self.project_dir);
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment variables, e.g. LODESTONE_DATABASE__REPLICATION_FACTOR.
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let merged: LodestoneConfig = builder.build()?.try_deserialize()?;
        validate(&merged)?;
        Ok(merged)
    }
}

fn validate(cfg: &LodestoneConfig) -> Result<(), ConfigError> {
    if cfg.database.replication_factor == 0 {
        return Err(ConfigError::Invalid(
            "replication_factor must be at least 1".into(),
        ));
    }
    if !(1..=2).contains(&cfg.database.usable_regions) {
        return Err(ConfigError::Invalid(
            "usable_regions must be 1 or 2".into(),
        ));
    }
    if cfg.database.usable_regions == 2 && cfg.database.remote_dcs().is_empty() {
        return Err(ConfigError::Invalid(
            "usable_regions=2 requires a remote region".into(),
        ));
    }
    if cfg.knobs.concurrent_audit_task_count_max == 0 {
        return Err(ConfigError::Invalid(
            "concurrent_audit_task_count_max must be positive".into(),
        ));
    }
    Ok(())
}
