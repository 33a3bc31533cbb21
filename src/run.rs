//! Run / Stream / Column model.
//!
//! A [`Run`] is the structured reconstruction of one experiment: its start
//! metadata, a set of named [`Stream`]s and, once finished, its stop document.
//! Each stream keeps one typed [`Column`] per declared field; every event
//! appends exactly one row across all columns, so columns always have the
//! same length.
//!
//! Runs are built by the [`RunAggregator`](crate::aggregator::RunAggregator)
//! and handed out as `Arc<Run>`. Outside the crate they are read-only. They
//! can be observed through:
//!
//! - [`Run::subscribe_new_stream`]: a stream was created or replaced
//! - [`Run::subscribe_completed`]: the stop document arrived
//! - [`Stream::subscribe_rows`]: one notification per appended row
//!
//! Incremental readers keep a cursor (row count) and call
//! [`Stream::read_since`] to fetch only new rows.

use crate::document::{DataKey, DescriptorDoc, EventDoc, FieldValue, StartDoc, StopDoc};
use crate::signal::{Signal, Subscription};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// All values of one field, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Field schema
    pub key: DataKey,
    /// One value per row
    pub values: Vec<FieldValue>,
}

impl Column {
    fn new(key: DataKey) -> Self {
        Self {
            key,
            values: Vec::new(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no rows were appended
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Numeric view of the column; non-numeric cells become NaN.
    pub fn to_f64(&self) -> Vec<f64> {
        self.values
            .iter()
            .map(|v| v.as_f64().unwrap_or(f64::NAN))
            .collect()
    }
}

/// One row of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Zero-based position in the stream
    pub index: usize,
    /// Sequence number carried by the event
    pub seq_num: u64,
    /// Event timestamp
    pub time_ns: u64,
    /// Field values of this row
    pub values: BTreeMap<String, FieldValue>,
}

#[derive(Debug)]
struct StreamState {
    descriptor: DescriptorDoc,
    columns: BTreeMap<String, Column>,
    seq_nums: Vec<u64>,
    times: Vec<u64>,
    degraded: bool,
}

/// What happened when an event was appended.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct AppendOutcome {
    /// The stream did not exist and was created from the event's fields
    pub created_stream: bool,
    /// Fields present in the event but not declared by the descriptor
    pub ignored_fields: Vec<String>,
    /// The sequence number did not increase
    pub out_of_order: bool,
}

/// A named, schema-described sequence of rows within a [`Run`].
#[derive(Debug)]
pub struct Stream {
    run_uid: String,
    name: String,
    state: RwLock<StreamState>,
    rows: Signal<Row>,
}

impl Stream {
    fn from_descriptor(descriptor: DescriptorDoc) -> Self {
        let columns = descriptor
            .data_keys
            .iter()
            .map(|(field, key)| (field.clone(), Column::new(key.clone())))
            .collect();
        Self {
            run_uid: descriptor.run_uid.clone(),
            name: descriptor.name.clone(),
            state: RwLock::new(StreamState {
                descriptor,
                columns,
                seq_nums: Vec::new(),
                times: Vec::new(),
                degraded: false,
            }),
            rows: Signal::new(),
        }
    }

    /// Stream whose schema is inferred from the first event seen for it.
    fn from_event(event: &EventDoc) -> Self {
        let mut descriptor = DescriptorDoc::new(&event.run_uid, &event.stream);
        for (field, value) in &event.data {
            descriptor = descriptor.with_data_key(field, DataKey::inferred(value));
        }
        let stream = Self::from_descriptor(descriptor);
        stream.state.write().degraded = true;
        stream
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning run
    pub fn run_uid(&self) -> &str {
        &self.run_uid
    }

    /// Descriptor this stream was built from (synthetic in degraded mode)
    pub fn descriptor(&self) -> DescriptorDoc {
        self.state.read().descriptor.clone()
    }

    /// Whether the schema was inferred from events rather than declared
    pub fn is_degraded(&self) -> bool {
        self.state.read().degraded
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.state.read().seq_nums.len()
    }

    /// Returns true if no rows were appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared field names
    pub fn fields(&self) -> Vec<String> {
        self.state.read().columns.keys().cloned().collect()
    }

    /// Whether the stream declares `field`
    pub fn has_field(&self, field: &str) -> bool {
        self.state.read().columns.contains_key(field)
    }

    /// Schema of one field
    pub fn data_key(&self, field: &str) -> Option<DataKey> {
        self.state.read().columns.get(field).map(|c| c.key.clone())
    }

    /// Snapshot of one column
    pub fn column(&self, field: &str) -> Option<Column> {
        self.state.read().columns.get(field).cloned()
    }

    /// Single cell by field and row index
    pub fn value(&self, field: &str, row: usize) -> Option<FieldValue> {
        self.state
            .read()
            .columns
            .get(field)
            .and_then(|c| c.values.get(row).cloned())
    }

    /// Values of `field` appended at or after `cursor`
    pub fn column_since(&self, field: &str, cursor: usize) -> Option<Vec<FieldValue>> {
        let state = self.state.read();
        let column = state.columns.get(field)?;
        Some(column.values.get(cursor..).unwrap_or_default().to_vec())
    }

    /// Full row by index
    pub fn row(&self, index: usize) -> Option<Row> {
        Self::row_of(&self.state.read(), index)
    }

    /// Rows appended at or after `cursor`, and the cursor to use next time.
    pub fn read_since(&self, cursor: usize) -> (Vec<Row>, usize) {
        let state = self.state.read();
        let len = state.seq_nums.len();
        let rows = (cursor.min(len)..len)
            .filter_map(|i| Self::row_of(&state, i))
            .collect();
        (rows, len)
    }

    /// Be notified of each appended row.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe_rows<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Row) + Send + Sync + 'static,
    {
        self.rows.connect(callback)
    }

    /// Number of live row subscriptions
    pub fn row_subscriber_count(&self) -> usize {
        self.rows.subscriber_count()
    }

    fn row_of(state: &StreamState, index: usize) -> Option<Row> {
        let seq_num = *state.seq_nums.get(index)?;
        let time_ns = state.times.get(index).copied().unwrap_or_default();
        let values = state
            .columns
            .iter()
            .filter_map(|(field, column)| {
                column.values.get(index).map(|v| (field.clone(), v.clone()))
            })
            .collect();
        Some(Row {
            index,
            seq_num,
            time_ns,
            values,
        })
    }

    fn append(&self, event: &EventDoc) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        let row = {
            let mut state = self.state.write();
            let index = state.seq_nums.len();

            if let Some(&last) = state.seq_nums.last() {
                outcome.out_of_order = event.seq_num <= last;
            }

            for (field, value) in &event.data {
                if state.columns.contains_key(field) {
                    continue;
                }
                if state.degraded {
                    // Backfill so the new column lines up with the older rows.
                    let mut column = Column::new(DataKey::inferred(value));
                    column.values.resize(index, FieldValue::Missing);
                    state
                        .descriptor
                        .data_keys
                        .insert(field.clone(), column.key.clone());
                    state.columns.insert(field.clone(), column);
                } else {
                    outcome.ignored_fields.push(field.clone());
                }
            }

            for (field, column) in state.columns.iter_mut() {
                let value = event.data.get(field).cloned().unwrap_or(FieldValue::Missing);
                column.values.push(value);
            }
            state.seq_nums.push(event.seq_num);
            state.times.push(event.time_ns);
            Self::row_of(&state, index)
        };

        if let Some(row) = row {
            self.rows.emit(&row);
        }
        outcome
    }
}

/// The structured reconstruction of one experiment.
#[derive(Debug)]
pub struct Run {
    start: StartDoc,
    streams: RwLock<BTreeMap<String, Arc<Stream>>>,
    stop: RwLock<Option<StopDoc>>,
    new_stream: Signal<String>,
    completed: Signal<StopDoc>,
}

impl Run {
    pub(crate) fn new(start: StartDoc) -> Self {
        Self {
            start,
            streams: RwLock::new(BTreeMap::new()),
            stop: RwLock::new(None),
            new_stream: Signal::new(),
            completed: Signal::new(),
        }
    }

    /// Run identifier
    pub fn uid(&self) -> &str {
        &self.start.uid
    }

    /// Start document
    pub fn start(&self) -> &StartDoc {
        &self.start
    }

    /// Run-level metadata (read-only after creation)
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.start.metadata
    }

    /// Stop document, once the run is closed
    pub fn stop(&self) -> Option<StopDoc> {
        self.stop.read().clone()
    }

    /// Whether the stop document arrived
    pub fn is_closed(&self) -> bool {
        self.stop.read().is_some()
    }

    /// Names of all streams
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }

    /// Stream by name
    pub fn stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams.read().get(name).cloned()
    }

    /// Be notified when a stream is created or replaced.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe_new_stream<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.new_stream.connect(callback)
    }

    /// Be notified when the run is closed.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe_completed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StopDoc) + Send + Sync + 'static,
    {
        self.completed.connect(callback)
    }

    /// Create or replace the stream named by `descriptor`.
    pub(crate) fn put_stream(&self, descriptor: DescriptorDoc) -> Arc<Stream> {
        let name = descriptor.name.clone();
        let stream = Arc::new(Stream::from_descriptor(descriptor));
        self.streams.write().insert(name.clone(), Arc::clone(&stream));
        self.new_stream.emit(&name);
        stream
    }

    /// Append one event, creating its stream from the event if needed.
    pub(crate) fn append_event(&self, event: &EventDoc) -> AppendOutcome {
        let existing = self.stream(&event.stream);
        let (stream, created) = match existing {
            Some(stream) => (stream, false),
            None => {
                let stream = Arc::new(Stream::from_event(event));
                self.streams
                    .write()
                    .insert(event.stream.clone(), Arc::clone(&stream));
                self.new_stream.emit(&event.stream);
                (stream, true)
            }
        };
        let mut outcome = stream.append(event);
        outcome.created_stream = created;
        outcome
    }

    /// Record the stop document and notify completion observers.
    pub(crate) fn close(&self, stop: StopDoc) {
        *self.stop.write() = Some(stop.clone());
        self.completed.emit(&stop);
    }
}
