//! Plot builders: policies that map runs onto plot specifications.
//!
//! A builder owns one [`Figure`]. For each run handed to
//! [`PlotBuilder::add_run`] it:
//!
//! 1. waits until the run has the stream it plots (and any `needs_streams`),
//!    re-checking whenever the run announces a new stream;
//! 2. validates the required fields, rejecting the run with `MissingField`
//!    (the run is skipped, nothing is drawn);
//! 3. creates its artists from the rows already present;
//! 4. follows the stream's row notifications, appending each new row to its
//!    artists in O(1).
//!
//! When more than `max_runs` runs are tracked, the oldest is torn down through
//! the same path as [`PlotBuilder::discard_run`]. When a run completes, the
//! builder drops its subscriptions for that run but keeps the artists.
//!
//! The concrete rendering policy lives in a [`PlotPolicy`]; [`Builder`] is the
//! shared engine. [`Auto`] attaches a builder to a
//! [`RunAggregator`](crate::aggregator::RunAggregator) so every new run is
//! offered to it.

pub mod auto;
pub mod images;
pub mod lines;
pub mod rastered;

pub use auto::{Auto, AutoImages, AutoLines, AutoRasteredImages};
pub use images::{Images, ImagesConfig, ImagesPolicy};
pub use lines::{Lines, LinesConfig, LinesPolicy};
pub use rastered::{RasteredImages, RasteredImagesConfig, RasteredPolicy};

use crate::error::{AppResult, Diagnostics, RunVizError};
use crate::plot_specs::{Artist, Axes, Figure};
use crate::run::{Row, Run, Stream};
use crate::signal::Subscription;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

/// Name of the stream builders read unless configured otherwise.
pub const DEFAULT_STREAM: &str = "primary";

pub(crate) fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

/// Public contract shared by all builders.
pub trait PlotBuilder: Send + Sync {
    /// Short builder kind ("lines", "images", ...)
    fn kind(&self) -> &'static str;

    /// Figure this builder draws into
    fn figure(&self) -> Arc<Figure>;

    /// Start plotting `run`. Fails with `MissingField` if the run's stream
    /// lacks a required field; such a run is not tracked.
    fn add_run(&self, run: &Arc<Run>) -> AppResult<()>;

    /// Stop plotting `run` and remove its artists. Idempotent.
    fn discard_run(&self, run: &Run);

    /// Re-evaluate a tracked run after `stream_name` appeared in it.
    fn handle_new_stream(&self, run: &Arc<Run>, stream_name: &str);

    /// Tracked runs, oldest first
    fn runs(&self) -> Vec<Arc<Run>>;
}

/// Options common to all builder kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderOptions {
    /// Stream the builder plots
    pub stream: String,
    /// Maximum number of tracked runs (`None` = unbounded)
    pub max_runs: Option<usize>,
    /// Streams that must exist before the run is plotted
    pub needs_streams: BTreeSet<String>,
}

impl BuilderOptions {
    pub(crate) fn validate(&self, kind: &str) -> AppResult<()> {
        if self.stream.is_empty() {
            return Err(RunVizError::Configuration(format!(
                "{kind}: stream name must not be empty"
            )));
        }
        if self.max_runs == Some(0) {
            return Err(RunVizError::Configuration(format!(
                "{kind}: max_runs must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Parse a builder configuration from loosely-typed options.
///
/// Unknown keys are rejected here, at construction time.
pub fn parse_options<C: DeserializeOwned>(kind: &str, options: serde_json::Value) -> AppResult<C> {
    serde_json::from_value(options)
        .map_err(|e| RunVizError::Configuration(format!("{kind}: {e}")))
}

/// Label for a run in artist labels: its `scan_id` if present, else a uid prefix.
pub(crate) fn run_label(run: &Run) -> String {
    match run.metadata().get("scan_id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => run.uid().chars().take(8).collect(),
    }
}

/// A rendering policy driven by [`Builder`].
pub trait PlotPolicy: Send + Sync + 'static {
    /// Per-run state: the artists created for one run.
    type Attached: Send + Sync + 'static;

    /// Short builder kind used in logs and errors
    fn kind(&self) -> &'static str;

    /// Common options
    fn options(&self) -> &BuilderOptions;

    /// Figure title
    fn title(&self) -> String;

    /// Fields the plotted stream must declare
    fn required_fields(&self) -> Vec<String>;

    /// Create the axes for the builder's figure. Called once, on first attach.
    fn create_axes(&self) -> Vec<Arc<Axes>>;

    /// Create and attach artists for `run` from its current rows.
    fn attach(&self, run: &Run, stream: &Stream, axes: &[Arc<Axes>]) -> AppResult<Self::Attached>;

    /// Fold one new row into the artists.
    fn on_row(&self, attached: &Self::Attached, row: &Row);

    /// Artists owned by `attached`
    fn artists(&self, attached: &Self::Attached) -> Vec<Arc<Artist>>;
}

struct Entry<A> {
    run: Arc<Run>,
    attached: Option<Arc<A>>,
    rows: Option<Subscription>,
    lifecycle: Vec<Subscription>,
}

enum Readiness {
    Ready(Arc<Stream>),
    Waiting,
}

/// Builder engine shared by all policies.
pub struct Builder<P: PlotPolicy> {
    policy: P,
    figure: Arc<Figure>,
    axes: Mutex<Vec<Arc<Axes>>>,
    entries: Mutex<VecDeque<Entry<P::Attached>>>,
    diagnostics: Diagnostics,
    weak_self: Weak<Self>,
}

impl<P: PlotPolicy> std::fmt::Debug for Builder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("kind", &self.policy.kind())
            .field("figure", &self.figure.uuid())
            .field("runs", &self.entries.lock().len())
            .finish()
    }
}

impl<P: PlotPolicy> Builder<P> {
    /// Create a builder around `policy`.
    pub fn with_policy(policy: P, diagnostics: &Diagnostics) -> Arc<Self> {
        let figure = Figure::new(policy.title());
        Arc::new_cyclic(|weak_self| Self {
            policy,
            figure,
            axes: Mutex::new(Vec::new()),
            entries: Mutex::new(VecDeque::new()),
            diagnostics: diagnostics.clone(),
            weak_self: weak_self.clone(),
        })
    }

    /// The rendering policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Axes created so far (empty until the first run is attached)
    pub fn axes(&self) -> Vec<Arc<Axes>> {
        self.axes.lock().clone()
    }

    /// Whether `run_uid` is tracked and has artists
    pub fn is_attached(&self, run_uid: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.run.uid() == run_uid && e.attached.is_some())
    }

    /// Artists created for `run_uid`
    pub fn artists_for(&self, run_uid: &str) -> Vec<Arc<Artist>> {
        let attached = self
            .entries
            .lock()
            .iter()
            .find(|e| e.run.uid() == run_uid)
            .and_then(|e| e.attached.clone());
        attached
            .map(|a| self.policy.artists(&a))
            .unwrap_or_default()
    }

    fn is_tracked(&self, run_uid: &str) -> bool {
        self.entries.lock().iter().any(|e| e.run.uid() == run_uid)
    }

    fn readiness(&self, run: &Run) -> Readiness {
        let options = self.policy.options();
        let names = run.stream_names();
        if !options.needs_streams.iter().all(|s| names.contains(s)) {
            return Readiness::Waiting;
        }
        match run.stream(&options.stream) {
            Some(stream) => Readiness::Ready(stream),
            None => Readiness::Waiting,
        }
    }

    fn ensure_axes(&self) -> Vec<Arc<Axes>> {
        {
            let axes = self.axes.lock();
            if !axes.is_empty() {
                return axes.clone();
            }
        }
        // Created outside the lock: adding axes notifies figure observers.
        let created = self.policy.create_axes();
        for axes in &created {
            if let Err(err) = self.figure.add_axes(Arc::clone(axes)) {
                self.diagnostics.report(self.policy.kind(), err);
            }
        }
        let mut axes = self.axes.lock();
        if axes.is_empty() {
            *axes = created;
        }
        axes.clone()
    }

    fn attach(&self, run: &Run, stream: &Stream) -> AppResult<Arc<P::Attached>> {
        if let Some(field) = self
            .policy
            .required_fields()
            .into_iter()
            .find(|f| !stream.has_field(f))
        {
            return Err(RunVizError::MissingField {
                builder: self.policy.kind().to_string(),
                run_uid: run.uid().to_string(),
                field,
            });
        }
        let axes = self.ensure_axes();
        let attached = self.policy.attach(run, stream, &axes)?;
        tracing::debug!(
            builder = self.policy.kind(),
            run_uid = run.uid(),
            stream = stream.name(),
            "attached run"
        );
        Ok(Arc::new(attached))
    }

    fn row_subscription(&self, stream: &Stream, attached: &Arc<P::Attached>) -> Subscription {
        let weak = self.weak_self.clone();
        let attached = Arc::clone(attached);
        stream.subscribe_rows(move |row| {
            if let Some(builder) = weak.upgrade() {
                builder.policy.on_row(&attached, row);
            }
        })
    }

    fn lifecycle_subscriptions(&self, run: &Arc<Run>) -> Vec<Subscription> {
        let weak_run = Arc::downgrade(run);
        let weak = self.weak_self.clone();
        let new_stream = run.subscribe_new_stream(move |name| {
            if let (Some(builder), Some(run)) = (weak.upgrade(), weak_run.upgrade()) {
                builder.handle_new_stream(&run, name);
            }
        });

        let weak = self.weak_self.clone();
        let run_uid = run.uid().to_string();
        let completed = run.subscribe_completed(move |_| {
            if let Some(builder) = weak.upgrade() {
                builder.on_run_completed(&run_uid);
            }
        });
        vec![new_stream, completed]
    }

    fn on_run_completed(&self, run_uid: &str) {
        let released = {
            let mut entries = self.entries.lock();
            let Some(pos) = entries.iter().position(|e| e.run.uid() == run_uid) else {
                return;
            };
            if entries[pos].attached.is_none() {
                tracing::debug!(
                    builder = self.policy.kind(),
                    run_uid,
                    "run completed before its stream appeared; untracking"
                );
                entries.remove(pos).map(|e| (e.rows, e.lifecycle))
            } else {
                let entry = &mut entries[pos];
                Some((entry.rows.take(), std::mem::take(&mut entry.lifecycle)))
            }
        };
        drop(released);
    }

    fn teardown(&self, entry: Entry<P::Attached>) {
        let Entry {
            run,
            attached,
            rows,
            lifecycle,
        } = entry;
        drop(rows);
        drop(lifecycle);
        if let Some(attached) = attached {
            self.remove_artists(&attached);
        }
        tracing::debug!(builder = self.policy.kind(), run_uid = run.uid(), "run discarded");
    }

    fn remove_artists(&self, attached: &P::Attached) {
        for artist in self.policy.artists(attached) {
            if let Some(axes) = artist.axes() {
                axes.discard(&artist);
            }
        }
    }

    fn evict_over_limit(&self) {
        let Some(max_runs) = self.policy.options().max_runs else {
            return;
        };
        let evicted: Vec<Entry<P::Attached>> = {
            let mut entries = self.entries.lock();
            let excess = entries.len().saturating_sub(max_runs);
            entries.drain(..excess).collect()
        };
        for entry in evicted {
            tracing::info!(
                builder = self.policy.kind(),
                run_uid = entry.run.uid(),
                max_runs,
                "evicting oldest run"
            );
            self.teardown(entry);
        }
    }
}

impl<P: PlotPolicy> PlotBuilder for Builder<P> {
    fn kind(&self) -> &'static str {
        self.policy.kind()
    }

    fn figure(&self) -> Arc<Figure> {
        Arc::clone(&self.figure)
    }

    fn add_run(&self, run: &Arc<Run>) -> AppResult<()> {
        if self.is_tracked(run.uid()) {
            tracing::debug!(builder = self.policy.kind(), run_uid = run.uid(), "run already tracked");
            return Ok(());
        }

        let (attached, rows) = match self.readiness(run) {
            Readiness::Ready(stream) => {
                let attached = self.attach(run, &stream)?;
                let rows = self.row_subscription(&stream, &attached);
                (Some(attached), Some(rows))
            }
            Readiness::Waiting => (None, None),
        };

        let lifecycle = if run.is_closed() {
            Vec::new()
        } else {
            self.lifecycle_subscriptions(run)
        };
        let rows = if run.is_closed() { None } else { rows };

        if attached.is_none() && run.is_closed() {
            tracing::debug!(
                builder = self.policy.kind(),
                run_uid = run.uid(),
                "closed run has nothing to plot"
            );
            return Ok(());
        }

        self.entries.lock().push_back(Entry {
            run: Arc::clone(run),
            attached,
            rows,
            lifecycle,
        });
        self.evict_over_limit();
        Ok(())
    }

    fn discard_run(&self, run: &Run) {
        let removed = {
            let mut entries = self.entries.lock();
            entries
                .iter()
                .position(|e| e.run.uid() == run.uid())
                .and_then(|pos| entries.remove(pos))
        };
        if let Some(entry) = removed {
            self.teardown(entry);
        }
    }

    fn handle_new_stream(&self, run: &Arc<Run>, stream_name: &str) {
        let previous = {
            let entries = self.entries.lock();
            match entries.iter().find(|e| e.run.uid() == run.uid()) {
                Some(entry) => entry.attached.clone(),
                None => return,
            }
        };

        let Readiness::Ready(stream) = self.readiness(run) else {
            return;
        };

        if let Some(previous) = previous {
            if stream_name != self.policy.options().stream {
                return;
            }
            // The plotted stream was replaced: rebuild from the new one.
            let old_rows = {
                let mut entries = self.entries.lock();
                entries
                    .iter_mut()
                    .find(|e| e.run.uid() == run.uid())
                    .and_then(|e| {
                        e.attached = None;
                        e.rows.take()
                    })
            };
            drop(old_rows);
            self.remove_artists(&previous);
        }

        match self.attach(run, &stream) {
            Ok(attached) => {
                let rows = self.row_subscription(&stream, &attached);
                let stored = {
                    let mut entries = self.entries.lock();
                    match entries.iter_mut().find(|e| e.run.uid() == run.uid()) {
                        Some(entry) => {
                            entry.attached = Some(Arc::clone(&attached));
                            entry.rows = Some(rows);
                            true
                        }
                        None => false,
                    }
                };
                if !stored {
                    self.remove_artists(&attached);
                }
            }
            Err(err) => {
                self.diagnostics.report(self.policy.kind(), err);
                self.discard_run(run);
            }
        }
    }

    fn runs(&self) -> Vec<Arc<Run>> {
        self.entries.lock().iter().map(|e| Arc::clone(&e.run)).collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::aggregator::{AggregatorConfig, RunAggregator};
    use crate::document::{DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
    use crate::error::Diagnostics;
    use crate::run::Run;
    use std::sync::Arc;

    /// Aggregator fed directly, without a bus.
    pub fn aggregator() -> RunAggregator {
        RunAggregator::new(AggregatorConfig::default(), Diagnostics::new())
    }

    pub fn feed(aggregator: &RunAggregator, docs: Vec<Document>) {
        for doc in docs {
            aggregator.process(&doc).unwrap();
        }
    }

    /// Open run with a "primary" stream declaring `fields` (scalars).
    pub fn open_run(aggregator: &RunAggregator, uid: &str, fields: &[&str]) -> Arc<Run> {
        let mut descriptor = DescriptorDoc::new(uid, "primary");
        for field in fields {
            descriptor = descriptor.with_data_key(field, DataKey::scalar(field, ""));
        }
        feed(
            aggregator,
            vec![StartDoc::with_uid(uid, "scan").into(), descriptor.into()],
        );
        aggregator.get(uid).unwrap()
    }

    pub fn event(uid: &str, seq: u64, values: &[(&str, f64)]) -> Document {
        let mut event = EventDoc::new(uid, "primary", seq);
        for (field, value) in values {
            event = event.with_datum(field, *value);
        }
        event.into()
    }

    pub fn stop(uid: &str) -> Document {
        StopDoc::success(uid).into()
    }
}
