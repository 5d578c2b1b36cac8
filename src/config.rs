//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con i parametri del coordinator e delle
//!   tre famiglie di optimiser
//! - Fornisce validazione dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Converte la configurazione nelle Options passate ai costruttori del core
//!
//! ## Parametri di configurazione:
//! - `workers`: Slot paralleli del coordinator (default: metà dei core, minimo 2)
//! - `image` / `video` / `pdf`: Options statiche per famiglia
//! - `output`: Marker, replace-in-place e conservazione timestamp
//! - `tools`: Override dei path dei tool esterni e directory dei tool bundled
//! - `temp_dir`: Radice delle directory temporanee (default: temp di sistema)
//! - `settle_timeout_ms`: Attesa massima per file ancora in scrittura
//! - `json_output`: Eventi JSON su stdout
//!
//! I campi mancanti nel file assumono il valore di default.
//!
//! ## Esempio:
//! ```rust
//! use media_engine::config::Config;
//!
//! let mut config = Config::default();
//! config.workers = 8;
//! config.pdf.lossy = true;
//! assert!(config.validate().is_ok());
//! ```

use crate::coordinator::{default_workers, CoordinatorOptions, DEFAULT_SETTLE_TIMEOUT};
use crate::optimizer::OptimiserOptions;
use crate::plan::{ImageOptions, OutputOptions, PdfOptions, VideoOptions};
use crate::tool_resolver::ToolPathResolver;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "media-engine";
const CONFIG_FILE_NAME: &str = "config.json";

/// Locations of the external tools
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Explicit executable per logical tool name (`ffmpeg`, `gs`, ...)
    pub paths: HashMap<String, PathBuf>,
    /// Directory holding bundled tools
    pub tools_dir: Option<PathBuf>,
}

/// Configuration for the media engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of parallel workers
    pub workers: usize,
    pub image: ImageOptions,
    pub video: VideoOptions,
    pub pdf: PdfOptions,
    pub output: OutputOptions,
    pub tools: ToolsConfig,
    /// Root for per-request scratch directories
    pub temp_dir: Option<PathBuf>,
    /// Maximum wait for a file still being written
    pub settle_timeout_ms: u64,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            image: ImageOptions::default(),
            video: VideoOptions::default(),
            pdf: PdfOptions::default(),
            output: OutputOptions::default(),
            tools: ToolsConfig::default(),
            temp_dir: None,
            settle_timeout_ms: DEFAULT_SETTLE_TIMEOUT.as_millis() as u64,
            json_output: false,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow::anyhow!("Number of workers must be greater than 0"));
        }

        if self.image.quality == 0 || self.image.quality > 100 {
            return Err(anyhow::anyhow!("Image quality must be between 1 and 100"));
        }

        if self.video.crf > 51 {
            return Err(anyhow::anyhow!("Video CRF must be between 0 and 51"));
        }

        if self.video.min_fps == 0 || self.video.min_fps > self.video.max_fps {
            return Err(anyhow::anyhow!(
                "Video fps bounds are invalid: min {} / max {}",
                self.video.min_fps,
                self.video.max_fps
            ));
        }

        if !(self.video.speed > 0.0 && self.video.speed.is_finite()) {
            return Err(anyhow::anyhow!("Video speed must be a positive number"));
        }

        if self.video.gif_quality == 0 || self.video.gif_quality > 100 {
            return Err(anyhow::anyhow!("GIF quality must be between 1 and 100"));
        }

        if !(72..=600).contains(&self.pdf.dpi) {
            return Err(anyhow::anyhow!("PDF dpi must be between 72 and 600"));
        }

        if self.output.marker.is_empty() || self.output.marker.contains(['/', '\\']) {
            return Err(anyhow::anyhow!("Invalid output marker: {:?}", self.output.marker));
        }

        if let Some(ref tools_dir) = self.tools.tools_dir {
            if !tools_dir.is_dir() {
                return Err(anyhow::anyhow!("Tools directory does not exist: {}", tools_dir.display()));
            }
        }

        Ok(())
    }

    /// Default config location (`<config dir>/media-engine/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file. A missing file yields the defaults.
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            workers: self.workers,
            settle_timeout: Duration::from_millis(self.settle_timeout_ms),
            temp_root: self.temp_dir.clone(),
            ..CoordinatorOptions::default()
        }
    }

    pub fn optimiser_options(&self) -> OptimiserOptions {
        OptimiserOptions {
            image: self.image.clone(),
            video: self.video.clone(),
            pdf: self.pdf.clone(),
            output: self.output.clone(),
        }
    }

    pub fn tool_resolver(&self) -> ToolPathResolver {
        ToolPathResolver::new(self.tools.paths.clone(), self.tools.tools_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 2;
        config.image.quality = 0;
        assert!(config.validate().is_err());

        config.image.quality = 80;
        config.video.crf = 52;
        assert!(config.validate().is_err());

        config.video.crf = 26;
        config.pdf.dpi = 30;
        assert!(config.validate().is_err());

        config.pdf.dpi = 150;
        config.output.marker = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.workers >= 2);
        assert_eq!(config.image.quality, 80);
        assert_eq!(config.video.crf, 26);
        assert_eq!(config.video.audio_bitrate, "128k");
        assert_eq!(config.output.marker, "optimised");
        assert!(!config.pdf.lossy);
        assert!(!config.json_output);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let mut original_config = Config::default();
        original_config.workers = 8;
        original_config.image.quality = 85;
        original_config.video.crf = 24;
        original_config.pdf.lossy = true;
        original_config.output.replace_in_place = true;
        original_config
            .tools
            .paths
            .insert("ffmpeg".to_string(), PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config, original_config);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{ "workers": 3, "pdf": { "lossy": true } }"#)
            .await
            .unwrap();

        let config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(config.workers, 3);
        assert!(config.pdf.lossy);
        assert_eq!(config.pdf.dpi, PdfOptions::default().dpi);
        assert_eq!(config.video, VideoOptions::default());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults_and_bad_json_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = Config::from_file(&temp_dir.path().join("none.json")).await.unwrap();
        assert_eq!(missing, Config::default());

        let broken = temp_dir.path().join("broken.json");
        tokio::fs::write(&broken, "{ not json").await.unwrap();
        let error = Config::from_file(&broken).await.unwrap_err();
        assert!(error.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_coordinator_options_mapping() {
        let config = Config {
            workers: 5,
            settle_timeout_ms: 1500,
            temp_dir: Some(PathBuf::from("/scratch")),
            ..Config::default()
        };
        let options = config.coordinator_options();
        assert_eq!(options.workers, 5);
        assert_eq!(options.settle_timeout, Duration::from_millis(1500));
        assert_eq!(options.temp_root, Some(PathBuf::from("/scratch")));
    }
}
