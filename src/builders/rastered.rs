//! `RasteredImages`: a scalar field placed pixel by pixel on a 2-D grid.
//!
//! Row `i` of the stream lands at grid position `(i / cols, i % cols)`; with
//! `snaking` the odd grid rows are filled right to left. Cells not yet reached
//! stay NaN.

use super::{default_stream, parse_options, run_label, Builder, BuilderOptions, PlotPolicy};
use crate::error::{AppResult, Diagnostics, RunVizError};
use crate::plot_specs::{pixel_count, Artist, Aspect, Axes, AxesProperties, DataSource};
use crate::run::{Row, Run, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

fn default_max_runs() -> Option<usize> {
    Some(1)
}

/// Configuration of a [`RasteredImages`] builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RasteredImagesConfig {
    /// Scalar field to raster
    pub field: String,
    /// Grid shape as (rows, cols)
    pub shape: (usize, usize),
    /// Reverse direction on every other grid row
    #[serde(default)]
    pub snaking: bool,
    /// Stream holding the readings
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Maximum number of runs kept on the plot
    #[serde(default = "default_max_runs")]
    pub max_runs: Option<usize>,
    /// Streams that must exist before a run is plotted
    #[serde(default)]
    pub needs_streams: BTreeSet<String>,
    /// Figure title; derived from the field when absent
    #[serde(default)]
    pub title: Option<String>,
}

impl RasteredImagesConfig {
    /// Place readings of `field` on a `shape` grid.
    pub fn new(field: &str, shape: (usize, usize)) -> Self {
        Self {
            field: field.to_string(),
            shape,
            snaking: false,
            stream: default_stream(),
            max_runs: default_max_runs(),
            needs_streams: BTreeSet::new(),
            title: None,
        }
    }

    /// Reverse the column order on every other row.
    pub fn snaking(mut self, snaking: bool) -> Self {
        self.snaking = snaking;
        self
    }

    /// Change how many runs stay on the plot.
    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Grid cell of stream row `index`, or `None` past the end of the grid.
    pub fn cell(&self, index: usize) -> Option<(usize, usize)> {
        let (rows, cols) = self.shape;
        let r = index / cols;
        if r >= rows {
            return None;
        }
        let c = index % cols;
        let c = if self.snaking && r % 2 == 1 { cols - 1 - c } else { c };
        Some((r, c))
    }
}

/// Raster plotting policy.
#[derive(Debug)]
pub struct RasteredPolicy {
    config: RasteredImagesConfig,
    options: BuilderOptions,
}

/// Builder rastering a scalar field onto a grid.
pub type RasteredImages = Builder<RasteredPolicy>;

impl Builder<RasteredPolicy> {
    /// Create a raster builder; invalid configuration fails here.
    pub fn new(config: RasteredImagesConfig, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        if config.field.is_empty() {
            return Err(RunVizError::Configuration(
                "rastered_images: field must not be empty".to_string(),
            ));
        }
        pixel_count(&config.field, config.shape)
            .map_err(|e| RunVizError::Configuration(format!("rastered_images: {e}")))?;
        let options = BuilderOptions {
            stream: config.stream.clone(),
            max_runs: config.max_runs,
            needs_streams: config.needs_streams.clone(),
        };
        options.validate("rastered_images")?;
        Ok(Builder::with_policy(RasteredPolicy { config, options }, diagnostics))
    }

    /// Create from untyped options such as `{"field": "det", "shape": [4, 4]}`.
    pub fn from_options(options: serde_json::Value, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        Self::new(parse_options("rastered_images", options)?, diagnostics)
    }
}

impl RasteredPolicy {
    fn place(&self, artist: &Artist, row: &Row) {
        let Some((r, c)) = self.config.cell(row.index) else {
            tracing::debug!(index = row.index, shape = ?self.config.shape, "row outside raster grid");
            return;
        };
        let value = row
            .values
            .get(&self.config.field)
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        artist.set_pixel(r, c, value);
    }
}

impl PlotPolicy for RasteredPolicy {
    type Attached = Arc<Artist>;

    fn kind(&self) -> &'static str {
        "rastered_images"
    }

    fn options(&self) -> &BuilderOptions {
        &self.options
    }

    fn title(&self) -> String {
        self.config
            .title
            .clone()
            .unwrap_or_else(|| format!("{} (raster)", self.config.field))
    }

    fn required_fields(&self) -> Vec<String> {
        vec![self.config.field.clone()]
    }

    fn create_axes(&self) -> Vec<Arc<Axes>> {
        let (rows, cols) = self.config.shape;
        vec![Axes::with_properties(AxesProperties {
            title: Some(self.config.field.clone()),
            x_limits: Some((-0.5, cols as f64 - 0.5)),
            y_limits: Some((-0.5, rows as f64 - 0.5)),
            aspect: Some(Aspect::Equal),
            ..AxesProperties::default()
        })]
    }

    fn attach(&self, run: &Run, stream: &Stream, axes: &[Arc<Axes>]) -> AppResult<Arc<Artist>> {
        let axes = axes
            .first()
            .ok_or_else(|| RunVizError::NotFound("rastered_images axes".to_string()))?;
        let source = DataSource {
            run_uid: run.uid().to_string(),
            stream: stream.name().to_string(),
            x: None,
            field: self.config.field.clone(),
        };
        let label = format!("{} {}", run_label(run), self.config.field);
        let artist = Artist::image(&label, source, self.config.shape)?;
        let (existing, _) = stream.read_since(0);
        for row in &existing {
            self.place(&artist, row);
        }
        axes.add_artist(Arc::clone(&artist))?;
        Ok(artist)
    }

    fn on_row(&self, artist: &Arc<Artist>, row: &Row) {
        self.place(artist, row);
    }

    fn artists(&self, artist: &Arc<Artist>) -> Vec<Arc<Artist>> {
        vec![Arc::clone(artist)]
    }
}
