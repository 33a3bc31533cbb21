//! Document model for experiment lifecycle streams.
//!
//! Documents are the unit of the ingestion protocol. A run is described by:
//!
//! - **StartDoc**: run identity and user metadata
//! - **DescriptorDoc**: schema of one named data stream
//! - **EventDoc**: one row of measurements in a stream
//! - **StopDoc**: completion status
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per data stream)
//!    │       │
//!    │       └── EventDoc (N, measurements)
//!    │
//! StopDoc (1)
//! ```
//!
//! Documents are immutable once built. Ordering within a stream is the arrival
//! order on the bus.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Document types for experiment data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start
    Start(StartDoc),
    /// Stream schema
    Descriptor(DescriptorDoc),
    /// One data point
    Event(EventDoc),
    /// Run stop
    Stop(StopDoc),
}

/// Discriminant of a [`Document`], used for bus filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// [`Document::Start`]
    Start,
    /// [`Document::Descriptor`]
    Descriptor,
    /// [`Document::Event`]
    Event,
    /// [`Document::Stop`]
    Stop,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Get the timestamp in nanoseconds
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::Start(d) => d.time_ns,
            Document::Descriptor(d) => d.time_ns,
            Document::Event(d) => d.time_ns,
            Document::Stop(d) => d.time_ns,
        }
    }

    /// Get the document kind
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::Stop(_) => DocumentKind::Stop,
        }
    }
}

impl From<StartDoc> for Document {
    fn from(doc: StartDoc) -> Self {
        Document::Start(doc)
    }
}

impl From<DescriptorDoc> for Document {
    fn from(doc: DescriptorDoc) -> Self {
        Document::Descriptor(doc)
    }
}

impl From<EventDoc> for Document {
    fn from(doc: EventDoc) -> Self {
        Document::Event(doc)
    }
}

impl From<StopDoc> for Document {
    fn from(doc: StopDoc) -> Self {
        Document::Stop(doc)
    }
}

/// A single value recorded for one field of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// The event did not carry this declared field
    Missing,
    /// Boolean reading
    Boolean(bool),
    /// Integer reading (counters, indices)
    Integer(i64),
    /// Floating point reading
    Number(f64),
    /// Text reading
    Text(String),
    /// Flattened array reading (image frames, spectra); shape lives in the [`DataKey`]
    Array(Vec<f64>),
}

impl FieldValue {
    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Number(v) => Some(*v),
            FieldValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Array view of an array value.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// The dtype a descriptor would declare for this value.
    pub fn dtype(&self) -> DType {
        match self {
            FieldValue::Boolean(_) => DType::Boolean,
            FieldValue::Integer(_) => DType::Integer,
            FieldValue::Number(_) | FieldValue::Missing => DType::Number,
            FieldValue::Text(_) => DType::String,
            FieldValue::Array(_) => DType::Array,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self {
        FieldValue::Array(v)
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// User-friendly plan name
    #[serde(default)]
    pub plan_name: String,
    /// User-provided metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Visualization hints (fields worth plotting)
    #[serde(default)]
    pub hints: Vec<String>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// New start document with a fresh run uid
    pub fn new(plan_name: &str) -> Self {
        Self::with_uid(&new_uid(), plan_name)
    }

    /// New start document for a known run uid
    pub fn with_uid(uid: &str, plan_name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            plan_name: plan_name.to_string(),
            metadata: BTreeMap::new(),
            hints: Vec::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Mark a field as worth plotting.
    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hints.push(hint.to_string());
        self
    }
}

/// Descriptor document - defines schema for event data
///
/// Each descriptor defines a named data stream (e.g. "primary" for main data,
/// "baseline" for background readings) with typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g., "primary", "baseline", "monitor")
    pub name: String,
    /// Schema for data fields
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Descriptor for stream `name` of run `run_uid`.
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Declare a field.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Declared type of a data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Floating point scalar
    Number,
    /// Integer scalar
    Integer,
    /// Text
    String,
    /// Boolean
    Boolean,
    /// N-dimensional array (see [`DataKey::shape`])
    Array,
}

impl DType {
    /// Whether values of this dtype can be drawn as a line.
    pub fn is_scalar_numeric(&self) -> bool {
        matches!(self, DType::Number | DType::Integer | DType::Boolean)
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type
    pub dtype: DType,
    /// Shape for arrays (empty for scalars)
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Source device ID
    #[serde(default)]
    pub source: String,
    /// Physical units
    #[serde(default)]
    pub units: String,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            dtype: DType::Number,
            shape: vec![],
            source: source.to_string(),
            units: units.to_string(),
        }
    }

    /// Create an integer data key
    pub fn integer(source: &str) -> Self {
        Self {
            dtype: DType::Integer,
            shape: vec![],
            source: source.to_string(),
            units: String::new(),
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<usize>) -> Self {
        Self {
            dtype: DType::Array,
            shape,
            source: source.to_string(),
            units: String::new(),
        }
    }

    /// Data key inferred from a bare value (degraded-schema mode)
    pub fn inferred(value: &FieldValue) -> Self {
        let shape = match value {
            FieldValue::Array(v) => vec![v.len()],
            _ => vec![],
        };
        Self {
            dtype: value.dtype(),
            shape,
            source: "inferred".to_string(),
            units: String::new(),
        }
    }
}

/// Event document - one row of measurements in a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Name of the stream this row belongs to
    pub stream: String,
    /// Event sequence number within this stream (1-based)
    pub seq_num: u64,
    /// Timestamp
    pub time_ns: u64,
    /// Data values (field name -> value)
    #[serde(default)]
    pub data: BTreeMap<String, FieldValue>,
    /// Per-field timestamps (field name -> timestamp_ns)
    #[serde(default)]
    pub timestamps: BTreeMap<String, u64>,
}

impl EventDoc {
    /// Event number `seq_num` of `stream`.
    pub fn new(run_uid: &str, stream: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            stream: stream.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    /// Set a field value, timestamped now.
    pub fn with_datum(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        let ts = now_ns();
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), ts);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    /// Completed normally
    Success,
    /// Stopped by the user
    Abort,
    /// Stopped by an error
    Fail,
}

impl StopDoc {
    fn with_status(run_uid: &str, exit_status: ExitStatus, reason: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time_ns: now_ns(),
        }
    }

    /// Successful completion.
    pub fn success(run_uid: &str) -> Self {
        Self::with_status(run_uid, ExitStatus::Success, "")
    }

    /// Run aborted.
    pub fn abort(run_uid: &str, reason: &str) -> Self {
        Self::with_status(run_uid, ExitStatus::Abort, reason)
    }

    /// Run failed.
    pub fn fail(run_uid: &str, reason: &str) -> Self {
        Self::with_status(run_uid, ExitStatus::Fail, reason)
    }
}
