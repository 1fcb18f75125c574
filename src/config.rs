//! Import configuration.
//!
//! Values come from `phorum-import.toml` (explicit path or discovered in the
//! current directory) and are then overridden by command line flags.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::app_error::{AppError, AppResult};
use crate::models::UserFieldSpec;
use crate::source::validate_identifier;

const CONFIG_FILENAME: &str = "phorum-import.toml";

/// Command line values that take precedence over the file.
#[derive(Debug, Default)]
pub struct CliSettings {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub table_prefix: Option<String>,
    pub base: Option<String>,
    pub batch_size: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub table_prefix: String,
    /// Column of the users table copied into the custom user field.
    pub custom_field_column: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("phorum.sqlite"),
            table_prefix: "phorum_".to_string(),
            custom_field_column: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DestinationConfig {
    /// Defaults to `forum.db` in the platform data directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Prefix of the legacy URLs, non-empty values end with `/`.
    pub base: String,
    pub batch_size: i64,
    pub tmp_dir: PathBuf,
    pub custom_user_field: Option<CustomUserFieldConfig>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            base: "phorum/".to_string(),
            batch_size: 1000,
            tmp_dir: std::env::temp_dir(),
            custom_user_field: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CustomUserFieldConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl CustomUserFieldConfig {
    pub fn spec(&self) -> UserFieldSpec {
        UserFieldSpec {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

impl Config {
    pub fn load(config_path: Option<&Path>, cli: &CliSettings) -> AppResult<Self> {
        let mut config = if let Some(path) = config_path {
            if !path.exists() {
                return Err(AppError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            Self::load_from_file(path)?
        } else {
            let discovered = std::env::current_dir()
                .map(|dir| dir.join(CONFIG_FILENAME))
                .ok()
                .filter(|path| path.exists());
            match discovered {
                Some(path) => Self::load_from_file(&path)?,
                None => Self::default(),
            }
        };

        config.apply_cli_settings(cli);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;

        let config_dir = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(config_dir);
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.source.path.is_relative() {
            self.source.path = base.join(&self.source.path);
        }
        if let Some(dest) = &self.destination.path {
            if dest.is_relative() {
                self.destination.path = Some(base.join(dest));
            }
        }
    }

    fn apply_cli_settings(&mut self, cli: &CliSettings) {
        if let Some(source) = &cli.source {
            self.source.path.clone_from(source);
        }
        if let Some(destination) = &cli.destination {
            self.destination.path = Some(destination.clone());
        }
        if let Some(prefix) = &cli.table_prefix {
            self.source.table_prefix.clone_from(prefix);
        }
        if let Some(base) = &cli.base {
            self.import.base.clone_from(base);
        }
        if let Some(batch_size) = cli.batch_size {
            self.import.batch_size = batch_size;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        validate_identifier(&self.source.table_prefix, "table prefix")?;
        if let Some(column) = &self.source.custom_field_column {
            validate_identifier(column, "custom field column")?;
        }
        if self.import.batch_size <= 0 {
            return Err(AppError::Validation("batch_size must be > 0".to_string()));
        }
        if !self.import.base.is_empty() && !self.import.base.ends_with('/') {
            return Err(AppError::Validation(format!(
                "base must be empty or end with '/': {:?}",
                self.import.base
            )));
        }
        if let Some(field) = &self.import.custom_user_field {
            if field.name.trim().is_empty() {
                return Err(AppError::Validation(
                    "custom_user_field.name is required".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn destination_path(&self) -> AppResult<PathBuf> {
        if let Some(path) = &self.destination.path {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("org", "phorum", "phorum-importer")
            .ok_or_else(|| AppError::Config("cannot resolve data dir".to_string()))?;
        Ok(dirs.data_dir().join("forum.db"))
    }
}
