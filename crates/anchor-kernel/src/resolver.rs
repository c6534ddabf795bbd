//! Project resolution and configuration layering.
//!
//! Resolves the active project id and produces the effective configuration
//! snapshot. Precedence for the project id: environment override, then the
//! project-local config file, then the global config file, then the literal
//! default. Config sources do not merge; the highest-precedence file that
//! exists fully shadows the rest.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use anchor_types::config::AnchorConfig;
use anchor_types::error::AnchorResult;

/// Environment variable overriding the project id.
const PROJECT_ID_ENV: &str = "MA_PROJECT_ID";

/// File name of a project-local config.
const PROJECT_CONFIG_FILE: &str = "anchor.toml";

/// Resolves project selection into a collection name and config snapshot.
pub struct ProjectResolver {
    /// Directory searched for the project-local config.
    project_dir: PathBuf,
    /// Path of the global config file.
    global_config: PathBuf,
}

impl ProjectResolver {
    /// Create a resolver rooted at the given project directory.
    pub fn new(project_dir: impl Into<PathBuf>, global_config: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            global_config: global_config.into(),
        }
    }

    /// Resolver for the current directory and the conventional global path.
    pub fn from_cwd() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            Path::new(&home).join(".memory-anchor").join("config.toml"),
        )
    }

    /// Produce the effective configuration snapshot.
    ///
    /// The highest-precedence config file that parses wins outright; there
    /// is no key-level merging. The environment project-id override applies
    /// on top of whichever snapshot won. Budget and safety env overrides
    /// apply last.
    pub fn resolve(&self) -> AnchorResult<AnchorConfig> {
        let mut config = self
            .load_file(&self.project_dir.join(PROJECT_CONFIG_FILE))
            .or_else(|| self.load_file(&self.global_config))
            .unwrap_or_else(|| {
                info!("no config file found, using defaults");
                AnchorConfig::default()
            });

        if let Ok(project_id) = std::env::var(PROJECT_ID_ENV) {
            if !project_id.is_empty() {
                debug!(project_id, "project id overridden from environment");
                config.project_id = project_id;
            }
        }

        config.budget = config.budget.with_env_overrides();
        config.safety = config.safety.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_file(&self, path: &Path) -> Option<AnchorConfig> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match AnchorConfig::from_toml(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    Some(config)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config file unparseable, skipping");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config file unreadable, skipping");
                None
            }
        }
    }
}
