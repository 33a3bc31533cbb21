//! Automatic builders: offer every run created by an aggregator to a builder.

use super::{Images, Lines, PlotBuilder, RasteredImages};
use crate::aggregator::RunAggregator;
use crate::error::Diagnostics;
use crate::run::Run;
use crate::signal::Subscription;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// A builder fed automatically with every new run.
///
/// Runs the builder rejects (for example with `MissingField`) are reported on
/// the aggregator's diagnostics and otherwise ignored. Dropping the `Auto`
/// stops the feed; the builder and its figure stay usable.
pub struct Auto<B: PlotBuilder + 'static> {
    builder: Arc<B>,
    _created: Subscription,
}

/// [`Lines`] fed with every new run
pub type AutoLines = Auto<Lines>;
/// [`Images`] fed with every new run
pub type AutoImages = Auto<Images>;
/// [`RasteredImages`] fed with every new run
pub type AutoRasteredImages = Auto<RasteredImages>;

impl<B: PlotBuilder + 'static> std::fmt::Debug for Auto<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auto")
            .field("kind", &self.builder.kind())
            .field("runs", &self.builder.runs().len())
            .finish()
    }
}

impl<B: PlotBuilder + 'static> Auto<B> {
    /// Feed `builder` with the open runs of `aggregator` and every run it
    /// creates from now on.
    pub fn new(builder: Arc<B>, aggregator: &RunAggregator) -> Self {
        let diagnostics = aggregator.diagnostics().clone();
        for run in aggregator.open_runs() {
            offer(builder.as_ref(), &run, &diagnostics);
        }

        let weak: Weak<B> = Arc::downgrade(&builder);
        let created = aggregator.subscribe_run_created(move |run| {
            if let Some(builder) = weak.upgrade() {
                offer(builder.as_ref(), run, &diagnostics);
            }
        });
        Self {
            builder,
            _created: created,
        }
    }

    /// The wrapped builder
    pub fn builder(&self) -> &Arc<B> {
        &self.builder
    }
}

fn offer<B: PlotBuilder>(builder: &B, run: &Arc<Run>, diagnostics: &Diagnostics) {
    if let Err(err) = builder.add_run(run) {
        diagnostics.report(builder.kind(), err);
    }
}

impl<B: PlotBuilder + 'static> Deref for Auto<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::test_support::{aggregator, event, feed, open_run, stop};
    use crate::builders::LinesConfig;
    use crate::error::RunVizError;

    #[test]
    fn test_auto_lines_evicts_oldest_but_run_survives() {
        let agg = aggregator();
        let lines = Lines::new(
            LinesConfig::new(Some("motor"), &["det"]).with_max_runs(Some(2)),
            agg.diagnostics(),
        )
        .unwrap();
        let auto = AutoLines::new(lines, &agg);

        let first = open_run(&agg, "A", &["motor", "det"]);
        feed(&agg, vec![event("A", 1, &[("motor", 0.0), ("det", 1.0)]), stop("A")]);
        open_run(&agg, "B", &["motor", "det"]);
        open_run(&agg, "C", &["motor", "det"]);

        let uids: Vec<String> = auto.runs().iter().map(|r| r.uid().to_string()).collect();
        assert_eq!(uids, vec!["B", "C"]);
        assert!(auto
            .figure()
            .axes()[0]
            .artists()
            .iter()
            .all(|a| a.data_source().run_uid != "A"));

        // The evicted run itself is untouched.
        assert!(first.is_closed());
        assert_eq!(first.stream("primary").unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_runs_are_reported() {
        let agg = aggregator();
        let mut rx = agg.diagnostics().subscribe();
        let lines = Lines::new(LinesConfig::new(None, &["detector"]), agg.diagnostics()).unwrap();
        let auto = AutoLines::new(lines, &agg);

        open_run(&agg, "A", &["motor"]);

        assert!(auto.runs().is_empty());
        let diag = rx.try_recv().unwrap();
        assert_eq!(diag.component, "lines");
        assert!(matches!(*diag.error, RunVizError::MissingField { .. }));
    }

    #[test]
    fn test_open_runs_are_picked_up_and_drop_stops_feed() {
        let agg = aggregator();
        open_run(&agg, "A", &["det"]);
        let lines = Lines::new(LinesConfig::new(None, &["det"]), agg.diagnostics()).unwrap();
        let auto = AutoLines::new(Arc::clone(&lines), &agg);
        assert_eq!(auto.runs().len(), 1);

        drop(auto);
        open_run(&agg, "B", &["det"]);
        assert_eq!(lines.runs().len(), 1);
    }
}
