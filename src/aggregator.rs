//! Run aggregator: turns flat documents into [`Run`] objects.
//!
//! The aggregator keeps a table of open runs keyed by run uid. Per run uid
//! the lifecycle is `absent → open → closed → absent`:
//!
//! | Document | Run state | Effect |
//! |---|---|---|
//! | Start | unknown | create run, emit `run_created` |
//! | Start | open | protocol violation, duplicate ignored |
//! | Start | closed | protocol violation unless `allow_uid_reuse` |
//! | Descriptor | open | create or replace the named stream |
//! | Event | open | append row (stream inferred if undeclared, with a warning) |
//! | Descriptor / Event / Stop | unknown or closed | protocol violation, dropped |
//! | Stop | open | close run, emit `run_completed`, remove from table |
//!
//! Protocol violations never change aggregator state. They are returned from
//! [`RunAggregator::process`] and reported on [`Diagnostics`].
//!
//! All state changes happen on whichever thread drives the bus; internal locks
//! are never held while notifications run.

use crate::bus::{DocumentBus, SubscriptionId};
use crate::document::{DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use crate::error::{AppResult, Diagnostics, RunVizError};
use crate::run::Run;
use crate::signal::{Signal, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Aggregator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    /// Accept a start document for a run uid that was already closed,
    /// producing a new, distinct Run.
    #[serde(default)]
    pub allow_uid_reuse: bool,
}

/// Stateful consumer of documents that maintains the table of open runs.
pub struct RunAggregator {
    config: AggregatorConfig,
    live: Mutex<HashMap<String, Arc<Run>>>,
    seen: Mutex<HashSet<String>>,
    run_created: Signal<Arc<Run>>,
    run_completed: Signal<Arc<Run>>,
    diagnostics: Diagnostics,
    attachment: Mutex<Option<(DocumentBus, SubscriptionId)>>,
}

impl std::fmt::Debug for RunAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunAggregator")
            .field("config", &self.config)
            .field("open_runs", &self.live.lock().len())
            .field("seen_runs", &self.seen.lock().len())
            .finish()
    }
}

/// Create an aggregator and attach it to `bus`.
///
/// The returned aggregator keeps processing documents until it is dropped or
/// [`RunAggregator::detach`] is called.
pub fn stream_documents_into_runs(bus: &DocumentBus, config: AggregatorConfig) -> Arc<RunAggregator> {
    let aggregator = Arc::new(RunAggregator::new(config, bus.diagnostics().clone()));
    aggregator.attach(bus);
    aggregator
}

impl RunAggregator {
    /// Create a detached aggregator.
    pub fn new(config: AggregatorConfig, diagnostics: Diagnostics) -> Self {
        Self {
            config,
            live: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            run_created: Signal::new(),
            run_completed: Signal::new(),
            diagnostics,
            attachment: Mutex::new(None),
        }
    }

    /// Subscribe to every document on `bus`. Replaces any previous attachment.
    pub fn attach(self: &Arc<Self>, bus: &DocumentBus) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = bus.subscribe_all(move |doc| {
            if let Some(aggregator) = weak.upgrade() {
                // Violations are reported by `process` itself.
                let _ = aggregator.process(doc);
            }
            Ok(())
        });
        let previous = self.attachment.lock().replace((bus.clone(), id));
        if let Some((old_bus, old_id)) = previous {
            old_bus.unsubscribe(old_id);
        }
    }

    /// Stop receiving documents from the bus.
    pub fn detach(&self) {
        if let Some((bus, id)) = self.attachment.lock().take() {
            bus.unsubscribe(id);
        }
    }

    /// Diagnostics channel used for recoverable errors.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Be notified when a start document creates a run.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe_run_created<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<Run>) + Send + Sync + 'static,
    {
        self.run_created.connect(callback)
    }

    /// Be notified when a stop document closes a run.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe_run_completed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<Run>) + Send + Sync + 'static,
    {
        self.run_completed.connect(callback)
    }

    /// Open run by uid.
    pub fn get(&self, run_uid: &str) -> Option<Arc<Run>> {
        self.live.lock().get(run_uid).cloned()
    }

    /// All open runs.
    pub fn open_runs(&self) -> Vec<Arc<Run>> {
        self.live.lock().values().cloned().collect()
    }

    /// Apply one document to the run table.
    pub fn process(&self, doc: &Document) -> AppResult<()> {
        let result = match doc {
            Document::Start(start) => self.on_start(start),
            Document::Descriptor(descriptor) => self.on_descriptor(descriptor),
            Document::Event(event) => self.on_event(event),
            Document::Stop(stop) => self.on_stop(stop),
        };
        if let Err(err) = &result {
            self.diagnostics.report("aggregator", err.clone());
        }
        result
    }

    fn open_run(&self, run_uid: &str, what: &str) -> AppResult<Arc<Run>> {
        if let Some(run) = self.get(run_uid) {
            return Ok(run);
        }
        let reason = if self.seen.lock().contains(run_uid) {
            format!("{what} for a run that is already closed")
        } else {
            format!("{what} before start")
        };
        Err(RunVizError::protocol(run_uid, reason))
    }

    fn on_start(&self, start: &StartDoc) -> AppResult<()> {
        let run = {
            let mut live = self.live.lock();
            if live.contains_key(&start.uid) {
                return Err(RunVizError::protocol(
                    &start.uid,
                    "duplicate start while the run is open",
                ));
            }
            let mut seen = self.seen.lock();
            if seen.contains(&start.uid) && !self.config.allow_uid_reuse {
                return Err(RunVizError::protocol(
                    &start.uid,
                    "run uid reused after the run was closed",
                ));
            }
            seen.insert(start.uid.clone());
            let run = Arc::new(Run::new(start.clone()));
            live.insert(start.uid.clone(), Arc::clone(&run));
            run
        };

        tracing::info!(run_uid = %start.uid, plan = %start.plan_name, "run created");
        let panicked = self.run_created.emit(&run);
        self.report_panicked(panicked, "run_created", &start.uid);
        Ok(())
    }

    fn on_descriptor(&self, descriptor: &DescriptorDoc) -> AppResult<()> {
        let run = self.open_run(&descriptor.run_uid, "descriptor")?;
        if run.stream(&descriptor.name).is_some() {
            tracing::debug!(
                run_uid = %descriptor.run_uid,
                stream = %descriptor.name,
                "replacing stream"
            );
        }
        run.put_stream(descriptor.clone());
        Ok(())
    }

    fn on_event(&self, event: &EventDoc) -> AppResult<()> {
        let run = self.open_run(&event.run_uid, "event")?;
        let outcome = run.append_event(event);

        if outcome.created_stream {
            self.diagnostics.report(
                "aggregator",
                RunVizError::protocol(
                    &event.run_uid,
                    format!(
                        "event for undeclared stream '{}'; schema inferred from its fields",
                        event.stream
                    ),
                ),
            );
        }
        if !outcome.ignored_fields.is_empty() {
            self.diagnostics.report(
                "aggregator",
                RunVizError::protocol(
                    &event.run_uid,
                    format!(
                        "stream '{}' does not declare {:?}; values ignored",
                        event.stream, outcome.ignored_fields
                    ),
                ),
            );
        }
        if outcome.out_of_order {
            tracing::debug!(
                run_uid = %event.run_uid,
                stream = %event.stream,
                seq_num = event.seq_num,
                "sequence number did not increase"
            );
        }
        Ok(())
    }

    fn on_stop(&self, stop: &StopDoc) -> AppResult<()> {
        let run = self.open_run(&stop.run_uid, "stop")?;
        if run.is_closed() {
            return Err(RunVizError::protocol(&stop.run_uid, "stop for a closed run"));
        }

        run.close(stop.clone());
        tracing::info!(
            run_uid = %stop.run_uid,
            exit_status = ?stop.exit_status,
            "run completed"
        );
        let panicked = self.run_completed.emit(&run);
        self.report_panicked(panicked, "run_completed", &stop.run_uid);
        self.live.lock().remove(&stop.run_uid);
        Ok(())
    }

    fn report_panicked(&self, panicked: usize, signal: &str, run_uid: &str) {
        if panicked > 0 {
            self.diagnostics.report(
                "aggregator",
                RunVizError::Subscriber(format!(
                    "{panicked} {signal} callback(s) panicked for run '{run_uid}'"
                )),
            );
        }
    }
}

impl Drop for RunAggregator {
    fn drop(&mut self) {
        self.detach();
    }
}
