//! Configuration loading using Figment.
//!
//! Configuration is merged from, lowest precedence first:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `RUNVIZ_`, nested with `__`
//!
//! ```text
//! RUNVIZ_APPLICATION__LOG_LEVEL=debug
//! RUNVIZ_DISPATCHER__ENDPOINT=tcp://beamline:5578
//! RUNVIZ_AGGREGATOR__ALLOW_UID_REUSE=true
//! ```
//!
//! A complete file:
//!
//! ```toml
//! [application]
//! name = "run_viz"
//! log_level = "info"
//!
//! [dispatcher]
//! endpoint = "tcp://127.0.0.1:5578"
//! encoding = "msgpack"
//!
//! [[lines]]
//! x = "motor"
//! y = ["det"]
//! max_runs = 3
//!
//! [[rastered_images]]
//! field = "det"
//! shape = [10, 10]
//! snaking = true
//! ```

use crate::aggregator::AggregatorConfig;
use crate::builders::{ImagesConfig, LinesConfig, RasteredImagesConfig};
use crate::dispatcher::DispatcherConfig;
use crate::error::{AppResult, RunVizError};
use crate::plot_specs::pixel_count;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "RUNVIZ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunVizConfig {
    /// Application name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Remote publisher connection
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Run aggregation policy
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Line builders
    #[serde(default)]
    pub lines: Vec<LinesConfig>,
    /// Image builders
    #[serde(default)]
    pub images: Vec<ImagesConfig>,
    /// Raster builders
    #[serde(default)]
    pub rastered_images: Vec<RasteredImagesConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_name() -> String {
    "run_viz".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RunVizConfig {
    /// Defaults overridden by the environment.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `path`, then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RunVizError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse a TOML document on top of the defaults, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints the types cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RunVizError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.dispatcher.validate()?;

        for (i, lines) in self.lines.iter().enumerate() {
            if lines.y.is_empty() {
                return Err(RunVizError::Configuration(format!("lines[{i}]: y must not be empty")));
            }
            check_max_runs("lines", i, lines.max_runs)?;
        }
        for (i, images) in self.images.iter().enumerate() {
            check_max_runs("images", i, images.max_runs)?;
        }
        for (i, raster) in self.rastered_images.iter().enumerate() {
            pixel_count(&raster.field, raster.shape)
                .map_err(|e| RunVizError::Configuration(format!("rastered_images[{i}]: {e}")))?;
            check_max_runs("rastered_images", i, raster.max_runs)?;
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RunVizError::Configuration(format!("cannot render configuration: {e}")))
    }

    /// Number of configured builders
    pub fn builder_count(&self) -> usize {
        self.lines.len() + self.images.len() + self.rastered_images.len()
    }
}

fn check_max_runs(kind: &str, index: usize, max_runs: Option<usize>) -> AppResult<()> {
    if max_runs == Some(0) {
        return Err(RunVizError::Configuration(format!(
            "{kind}[{index}]: max_runs must be at least 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Encoding;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunVizConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.builder_count(), 0);
        assert_eq!(config.dispatcher.encoding, Encoding::Msgpack);
    }

    #[test]
    fn test_builder_tables() {
        let config = RunVizConfig::from_toml_str(
            r#"
            [dispatcher]
            encoding = "json"

            [[lines]]
            x = "motor"
            y = ["det1", "det2"]
            max_runs = 3

            [[rastered_images]]
            field = "det"
            shape = [4, 5]
            snaking = true
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.encoding, Encoding::Json);
        assert_eq!(config.lines[0].y, vec!["det1", "det2"]);
        assert_eq!(config.lines[0].max_runs, Some(3));
        assert_eq!(config.lines[0].stream, "primary");
        assert_eq!(config.rastered_images[0].shape, (4, 5));
        assert_eq!(config.builder_count(), 2);
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let mut config = RunVizConfig::default();
        config.lines.push(LinesConfig::new(Some("motor"), &["det"]));
        config.rastered_images.push(RasteredImagesConfig::new("det", (3, 3)).snaking(true));

        let rendered = config.to_toml().unwrap();
        assert_eq!(RunVizConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = RunVizConfig::from_toml_str(
            r#"
            [[lines]]
            y = ["det"]
            colour = "red"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, RunVizError::Config(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let err = RunVizConfig::from_toml_str("[application]\nlog_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_max_runs_rejected() {
        let err = RunVizConfig::from_toml_str("[[images]]\nfield = \"frame\"\nmax_runs = 0").unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(_)));
    }

    #[test]
    fn test_oversized_raster_rejected() {
        let err = RunVizConfig::from_toml_str(
            "[[rastered_images]]\nfield = \"det\"\nshape = [100000, 100000]",
        )
        .unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(ref msg) if msg.contains("pixels")));
    }

    #[test]
    #[serial]
    fn test_file_then_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[dispatcher]\nendpoint = \"tcp://file:1\"\ntopic = \"bluesky\""
        )
        .unwrap();

        std::env::set_var("RUNVIZ_DISPATCHER__ENDPOINT", "tcp://env:2");
        let loaded = RunVizConfig::load_from(file.path());
        std::env::remove_var("RUNVIZ_DISPATCHER__ENDPOINT");

        let config = loaded.unwrap();
        assert_eq!(config.dispatcher.endpoint, "tcp://env:2");
        assert_eq!(config.dispatcher.topic, "bluesky");
    }

    #[test]
    #[serial]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RunVizConfig::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(_)));
    }
}
