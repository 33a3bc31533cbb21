//! `Lines`: one line per run for each configured y field.
//!
//! One [`Axes`] is created per y field; every tracked run contributes one line
//! to each of them. Without an `x` field the row index is used as x.

use super::{default_stream, parse_options, run_label, Builder, BuilderOptions, PlotPolicy};
use crate::error::{AppResult, Diagnostics, RunVizError};
use crate::plot_specs::{Artist, Axes, AxesProperties};
use crate::run::{Row, Run, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

fn default_max_runs() -> Option<usize> {
    Some(10)
}

fn default_label() -> String {
    "{run} {field}".to_string()
}

/// Configuration of a [`Lines`] builder.
///
/// ```toml
/// [[lines]]
/// x = "motor"
/// y = ["det1", "det2"]
/// max_runs = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinesConfig {
    /// X field; row index when absent
    #[serde(default)]
    pub x: Option<String>,
    /// Y fields, one axes each
    pub y: Vec<String>,
    /// Stream to plot
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Maximum number of runs kept on the plot
    #[serde(default = "default_max_runs")]
    pub max_runs: Option<usize>,
    /// Streams that must exist before a run is plotted
    #[serde(default)]
    pub needs_streams: BTreeSet<String>,
    /// Figure title; derived from the fields when absent
    #[serde(default)]
    pub title: Option<String>,
    /// Artist label template; `{run}`, `{field}` and `{plan}` are substituted
    #[serde(default = "default_label")]
    pub label: String,
}

impl LinesConfig {
    /// Plot `y` fields against `x`.
    pub fn new(x: Option<&str>, y: &[&str]) -> Self {
        Self {
            x: x.map(str::to_string),
            y: y.iter().map(|s| s.to_string()).collect(),
            stream: default_stream(),
            max_runs: default_max_runs(),
            needs_streams: BTreeSet::new(),
            title: None,
            label: default_label(),
        }
    }

    /// Change how many runs stay on the plot.
    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Plot a stream other than `primary`.
    pub fn with_stream(mut self, stream: &str) -> Self {
        self.stream = stream.to_string();
        self
    }

    /// Wait for `stream` before plotting a run.
    pub fn with_needs_stream(mut self, stream: &str) -> Self {
        self.needs_streams.insert(stream.to_string());
        self
    }

    fn validate(&self) -> AppResult<()> {
        if self.y.is_empty() {
            return Err(RunVizError::Configuration(
                "lines: at least one y field is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Line plotting policy.
#[derive(Debug)]
pub struct LinesPolicy {
    config: LinesConfig,
    options: BuilderOptions,
}

/// Lines created for one run, in the order of the configured y fields.
#[derive(Debug)]
pub struct RunLines {
    lines: Vec<(String, Arc<Artist>)>,
}

/// Builder drawing one line per run and y field.
pub type Lines = Builder<LinesPolicy>;

impl Builder<LinesPolicy> {
    /// Create a lines builder; invalid configuration fails here.
    pub fn new(config: LinesConfig, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        config.validate()?;
        let options = BuilderOptions {
            stream: config.stream.clone(),
            max_runs: config.max_runs,
            needs_streams: config.needs_streams.clone(),
        };
        options.validate("lines")?;
        Ok(Builder::with_policy(LinesPolicy { config, options }, diagnostics))
    }

    /// Create from untyped options such as
    /// `{"x": "motor", "y": ["det"], "max_runs": 2}`.
    pub fn from_options(options: serde_json::Value, diagnostics: &Diagnostics) -> AppResult<Arc<Self>> {
        Self::new(parse_options("lines", options)?, diagnostics)
    }
}

impl LinesPolicy {
    /// Builder configuration
    pub fn config(&self) -> &LinesConfig {
        &self.config
    }

    fn x_of(&self, row: &Row) -> f64 {
        match &self.config.x {
            Some(x) => row
                .values
                .get(x)
                .and_then(|v| v.as_f64())
                .unwrap_or(f64::NAN),
            None => row.index as f64,
        }
    }

    fn label_for(&self, run: &Run, field: &str) -> String {
        self.config
            .label
            .replace("{run}", &run_label(run))
            .replace("{field}", field)
            .replace("{plan}", &run.start().plan_name)
    }
}

impl PlotPolicy for LinesPolicy {
    type Attached = RunLines;

    fn kind(&self) -> &'static str {
        "lines"
    }

    fn options(&self) -> &BuilderOptions {
        &self.options
    }

    fn title(&self) -> String {
        self.config.title.clone().unwrap_or_else(|| {
            let x = self.config.x.as_deref().unwrap_or("index");
            format!("{} vs. {}", self.config.y.join(", "), x)
        })
    }

    fn required_fields(&self) -> Vec<String> {
        self.config
            .x
            .iter()
            .chain(self.config.y.iter())
            .cloned()
            .collect()
    }

    fn create_axes(&self) -> Vec<Arc<Axes>> {
        self.config
            .y
            .iter()
            .map(|y| {
                Axes::with_properties(AxesProperties {
                    title: Some(y.clone()),
                    x_label: Some(self.config.x.clone().unwrap_or_else(|| "index".to_string())),
                    y_label: Some(y.clone()),
                    ..AxesProperties::default()
                })
            })
            .collect()
    }

    fn attach(&self, run: &Run, stream: &Stream, axes: &[Arc<Axes>]) -> AppResult<RunLines> {
        let mut lines = Vec::with_capacity(self.config.y.len());
        for y in &self.config.y {
            let artist = Artist::line_from_run(
                run,
                stream.name(),
                self.config.x.as_deref(),
                y,
                &self.label_for(run, y),
            )?;
            lines.push((y.clone(), artist));
        }
        // Artists are only attached once every line was built, so a failure
        // leaves the axes untouched.
        for ((_, artist), axes) in lines.iter().zip(axes) {
            axes.add_artist(Arc::clone(artist))?;
        }
        Ok(RunLines { lines })
    }

    fn on_row(&self, attached: &RunLines, row: &Row) {
        let x = self.x_of(row);
        for (y, artist) in &attached.lines {
            let value = row.values.get(y).and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
            artist.push_point(x, value);
        }
    }

    fn artists(&self, attached: &RunLines) -> Vec<Arc<Artist>> {
        attached.lines.iter().map(|(_, a)| Arc::clone(a)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::test_support::{aggregator, event, feed, open_run, stop};
    use crate::builders::PlotBuilder;
    use crate::plot_specs::ArtistData;
    use serde_json::json;

    #[test]
    fn test_missing_field_creates_nothing() {
        let agg = aggregator();
        let run = open_run(&agg, "A", &["motor"]);
        let lines = Lines::new(LinesConfig::new(Some("motor"), &["detector"]), &Diagnostics::new()).unwrap();

        let err = lines.add_run(&run).unwrap_err();
        assert!(matches!(err, RunVizError::MissingField { ref field, .. } if field == "detector"));
        assert!(lines.figure().axes().is_empty());
        assert!(lines.runs().is_empty());
    }

    #[test]
    fn test_qualifying_run_gets_one_axes_one_line() {
        let agg = aggregator();
        let run = open_run(&agg, "A", &["motor", "detector"]);
        feed(&agg, vec![event("A", 1, &[("motor", 1.0), ("detector", 10.0)])]);

        let lines = Lines::new(LinesConfig::new(Some("motor"), &["detector"]), &Diagnostics::new()).unwrap();
        lines.add_run(&run).unwrap();

        let axes = lines.figure().axes();
        assert_eq!(axes.len(), 1);
        let artists = axes[0].artists();
        assert_eq!(artists.len(), 1);
        let source = artists[0].data_source();
        assert_eq!(source.x.as_deref(), Some("motor"));
        assert_eq!(source.field, "detector");
        assert_eq!(source.run_uid, "A");

        feed(&agg, vec![event("A", 2, &[("motor", 2.0), ("detector", 20.0)])]);
        assert_eq!(
            artists[0].data(),
            ArtistData::Line {
                x: vec![1.0, 2.0],
                y: vec![10.0, 20.0]
            }
        );
    }

    #[test]
    fn test_late_stream_attaches_on_descriptor() {
        let agg = aggregator();
        feed(&agg, vec![crate::document::StartDoc::with_uid("A", "scan").into()]);
        let run = agg.get("A").unwrap();

        let lines = Lines::new(LinesConfig::new(None, &["det"]), &Diagnostics::new()).unwrap();
        lines.add_run(&run).unwrap();
        assert!(!lines.is_attached("A"));

        feed(
            &agg,
            vec![
                crate::document::DescriptorDoc::new("A", "primary")
                    .with_data_key("det", crate::document::DataKey::scalar("det", ""))
                    .into(),
                event("A", 1, &[("det", 3.0)]),
                event("A", 2, &[("det", 4.0)]),
            ],
        );
        assert!(lines.is_attached("A"));
        assert_eq!(
            lines.artists_for("A")[0].data(),
            ArtistData::Line {
                x: vec![0.0, 1.0],
                y: vec![3.0, 4.0]
            }
        );
    }

    #[test]
    fn test_needs_streams_delays_attach() {
        let agg = aggregator();
        let run = open_run(&agg, "A", &["det"]);
        let lines = Lines::new(
            LinesConfig::new(None, &["det"]).with_needs_stream("baseline"),
            &Diagnostics::new(),
        )
        .unwrap();
        lines.add_run(&run).unwrap();
        feed(&agg, vec![event("A", 1, &[("det", 1.0)])]);
        assert!(!lines.is_attached("A"));
        assert_eq!(lines.runs().len(), 1);
        assert!(lines.figure().axes().is_empty());

        feed(
            &agg,
            vec![crate::document::DescriptorDoc::new("A", "baseline")
                .with_data_key("temp", crate::document::DataKey::scalar("temp", "K"))
                .into()],
        );
        assert!(lines.is_attached("A"));
        assert_eq!(
            lines.artists_for("A")[0].data(),
            ArtistData::Line {
                x: vec![0.0],
                y: vec![1.0]
            }
        );
    }

    #[test]
    fn test_replaced_stream_rebuilds_lines() {
        let agg = aggregator();
        let run = open_run(&agg, "A", &["det"]);
        let lines = Lines::new(LinesConfig::new(None, &["det"]), &Diagnostics::new()).unwrap();
        lines.add_run(&run).unwrap();
        feed(
            &agg,
            vec![event("A", 1, &[("det", 1.0)]), event("A", 2, &[("det", 2.0)])],
        );
        let old_stream = run.stream("primary").unwrap();
        let old_artist = lines.artists_for("A").remove(0);

        feed(
            &agg,
            vec![
                crate::document::DescriptorDoc::new("A", "primary")
                    .with_data_key("det", crate::document::DataKey::scalar("det", ""))
                    .into(),
                event("A", 3, &[("det", 7.0)]),
            ],
        );

        let artists = lines.figure().axes()[0].artists();
        assert_eq!(artists.len(), 1);
        assert_ne!(artists[0].uuid(), old_artist.uuid());
        assert!(old_artist.axes().is_none());
        assert_eq!(
            artists[0].data(),
            ArtistData::Line {
                x: vec![0.0],
                y: vec![7.0]
            }
        );
        assert_eq!(old_stream.row_subscriber_count(), 0);
    }

    #[test]
    fn test_discard_run_is_idempotent() {
        let agg = aggregator();
        let a = open_run(&agg, "A", &["det"]);
        let b = open_run(&agg, "B", &["det"]);
        let lines = Lines::new(LinesConfig::new(None, &["det"]), &Diagnostics::new()).unwrap();
        lines.add_run(&a).unwrap();
        lines.add_run(&b).unwrap();

        lines.discard_run(&a);
        let after_once: Vec<_> = lines.figure().axes()[0].artists().iter().map(|a| a.uuid()).collect();
        lines.discard_run(&a);
        let after_twice: Vec<_> = lines.figure().axes()[0].artists().iter().map(|a| a.uuid()).collect();

        assert_eq!(after_once, after_twice);
        assert_eq!(after_once.len(), 1);
        assert_eq!(lines.runs().len(), 1);
    }

    #[test]
    fn test_max_runs_evicts_oldest() {
        let agg = aggregator();
        let lines = Lines::new(
            LinesConfig::new(None, &["det"]).with_max_runs(Some(2)),
            &Diagnostics::new(),
        )
        .unwrap();
        for uid in ["A", "B", "C"] {
            let run = open_run(&agg, uid, &["det"]);
            lines.add_run(&run).unwrap();
        }

        let uids: Vec<String> = lines.runs().iter().map(|r| r.uid().to_string()).collect();
        assert_eq!(uids, vec!["B", "C"]);
        let sources: Vec<String> = lines.figure().axes()[0]
            .artists()
            .iter()
            .map(|a| a.data_source().run_uid.clone())
            .collect();
        assert_eq!(sources, vec!["B", "C"]);
    }

    #[test]
    fn test_completed_run_keeps_lines_but_stops_listening() {
        let agg = aggregator();
        let run = open_run(&agg, "A", &["det"]);
        let lines = Lines::new(LinesConfig::new(None, &["det"]), &Diagnostics::new()).unwrap();
        lines.add_run(&run).unwrap();
        feed(&agg, vec![event("A", 1, &[("det", 1.0)]), stop("A")]);

        assert_eq!(lines.artists_for("A")[0].data_len(), 1);
        assert_eq!(run.stream("primary").unwrap().row_subscriber_count(), 0);
        assert_eq!(lines.runs().len(), 1);
    }

    #[test]
    fn test_unknown_option_fails_at_construction() {
        let err = Lines::from_options(json!({"y": ["det"], "colour": "red"}), &Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(ref msg) if msg.contains("colour")));

        let err = Lines::from_options(json!({"y": []}), &Diagnostics::new()).unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(_)));

        let err = Lines::from_options(json!({"y": ["det"], "max_runs": 0}), &Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, RunVizError::Configuration(_)));

        assert!(Lines::from_options(json!({"x": "motor", "y": ["det"], "max_runs": 2}), &Diagnostics::new()).is_ok());
    }

    #[test]
    fn test_label_template() {
        let agg = aggregator();
        feed(
            &agg,
            vec![
                crate::document::StartDoc::with_uid("abcdef0123", "count")
                    .with_metadata("scan_id", 7)
                    .into(),
                crate::document::DescriptorDoc::new("abcdef0123", "primary")
                    .with_data_key("det", crate::document::DataKey::scalar("det", ""))
                    .into(),
            ],
        );
        let run = agg.get("abcdef0123").unwrap();
        let mut config = LinesConfig::new(None, &["det"]);
        config.label = "scan {run}: {field} ({plan})".to_string();
        let lines = Lines::new(config, &Diagnostics::new()).unwrap();
        lines.add_run(&run).unwrap();
        assert_eq!(lines.artists_for("abcdef0123")[0].label(), "scan 7: det (count)");
    }
}
