use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::error::{ReaderError, Result};

pub(crate) const DEFAULT_RENDER_SCALE: f32 = 1.1;
const DEFAULT_API_ENDPOINT: &str = "http://127.0.0.1:8000/api/mock-book/";

/// Reader settings, read from `config.toml`. Every field has a default.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Endpoint answering `{ "pdf_url": ... }` for the book to open.
    pub api_endpoint: String,
    pub render_scale: f32,
    /// Upper bound for one page render; unset means wait indefinitely.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub render_timeout: Option<Duration>,
    /// Overrides the platform data directory for saved progress.
    pub state_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            api_endpoint: DEFAULT_API_ENDPOINT.to_owned(),
            render_scale: DEFAULT_RENDER_SCALE,
            render_timeout: None,
            state_dir: None,
            log_filter: "info".to_owned(),
        }
    }
}

impl ReaderConfig {
    /// Reads the file at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|err| ReaderError::Config {
            path: path.to_path_buf(),
            cause: err.into(),
        })?;
        Self::from_toml_str(&raw).map_err(|cause| ReaderError::Config {
            path: path.to_path_buf(),
            cause,
        })
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.render_scale.is_finite() || self.render_scale <= 0.0 {
            return Err(anyhow!(
                "render_scale must be a positive number, got {}",
                self.render_scale
            ));
        }
        if self.render_timeout == Some(Duration::ZERO) {
            return Err(anyhow!("render_timeout must be greater than zero"));
        }
        if self.api_endpoint.trim().is_empty() {
            return Err(anyhow!("api_endpoint must not be empty"));
        }
        Ok(())
    }
}
