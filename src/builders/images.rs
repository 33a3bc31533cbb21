//! `Images`: the latest frame of an array field, one image per run.

use super::{default_stream, parse_options, run_label, Builder, BuilderOptions, PlotPolicy};
use crate::document::FieldValue;
use crate::error::{AppResult, Diagnostics, RunVizError};
use crate::plot_specs::{Artist, Axes, AxesProperties};
use crate::run::{Row, Run, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

fn default_max_runs() -> Option<usize> {
    Some(1)
}

/// Configuration of an [`Images`] builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImagesConfig {
    /// Array field holding the frames
    pub field: String,
    /// Stream holding the frames
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Maximum number of runs kept on the plot
    #[serde(default = "default_max_runs")]
    pub max_runs: Option<usize>,
    /// Streams that must exist before a run is plotted
    #[serde(default)]
    pub needs_streams: BTreeSet<String>,
    /// Figure title; the field name when absent
    #[serde(default)]
    pub title: Option<String>,
}

impl ImagesConfig {
    /// Show the latest frame of `field`.
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
            stream: default_stream(),
            max_runs: default_max_runs(),
            needs_streams: BTreeSet::new(),
            title: None,
        }
    }

    /// Change how many runs stay on the plot.
    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }
}

/// Image plotting policy.
#[derive(Debug)]
pub struct ImagesPolicy {
    config: ImagesConfig,
    options: BuilderOptions,
}

/// Builder showing the most recent frame of each run.
pub type Images = Builder<ImagesPolicy>;

impl Builder<ImagesPolicy> {
    /// Create an images builder; invalid configuration fails here.
    pub fn new(config: ImagesConfig, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        if config.field.is_empty() {
            return Err(RunVizError::Configuration(
                "images: field must not be empty".to_string(),
            ));
        }
        let options = BuilderOptions {
            stream: config.stream.clone(),
            max_runs: config.max_runs,
            needs_streams: config.needs_streams.clone(),
        };
        options.validate("images")?;
        Ok(Builder::with_policy(ImagesPolicy { config, options }, diagnostics))
    }

    /// Create from untyped options such as `{"field": "frame"}`.
    pub fn from_options(options: serde_json::Value, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        Self::new(parse_options("images", options)?, diagnostics)
    }
}

impl PlotPolicy for ImagesPolicy {
    type Attached = Arc<Artist>;

    fn kind(&self) -> &'static str {
        "images"
    }

    fn options(&self) -> &BuilderOptions {
        &self.options
    }

    fn title(&self) -> String {
        self.config
            .title
            .clone()
            .unwrap_or_else(|| self.config.field.clone())
    }

    fn required_fields(&self) -> Vec<String> {
        vec![self.config.field.clone()]
    }

    fn create_axes(&self) -> Vec<Arc<Axes>> {
        vec![Axes::with_properties(AxesProperties {
            title: Some(self.config.field.clone()),
            ..AxesProperties::default()
        })]
    }

    fn attach(&self, run: &Run, stream: &Stream, axes: &[Arc<Axes>]) -> AppResult<Arc<Artist>> {
        let axes = axes
            .first()
            .ok_or_else(|| RunVizError::NotFound("images axes".to_string()))?;
        let label = format!("{} {}", run_label(run), self.config.field);
        let artist = Artist::image_from_run(run, stream.name(), &self.config.field, &label)?;
        axes.add_artist(Arc::clone(&artist))?;
        Ok(artist)
    }

    fn on_row(&self, artist: &Arc<Artist>, row: &Row) {
        match row.values.get(&self.config.field) {
            Some(FieldValue::Array(frame)) => artist.set_frame(frame),
            Some(FieldValue::Missing) | None => {}
            Some(other) => {
                tracing::debug!(field = %self.config.field, dtype = ?other.dtype(), "non-array frame skipped")
            }
        }
    }

    fn artists(&self, artist: &Arc<Artist>) -> Vec<Arc<Artist>> {
        vec![Arc::clone(artist)]
    }
}
