//! Renderer-agnostic plot specification model.
//!
//! A small observable object graph describing *what* to draw:
//!
//! ```text
//! FigureList ─┬─ Figure ─┬─ Axes ─┬─ Artist (Line)
//!             │          │        └─ Artist (Image)
//!             │          └─ Axes ...
//!             └─ Figure ...
//! ```
//!
//! Parents own their children (`Arc`); children keep a non-owning back
//! reference (`Weak`) to their parent. The pair is only changed through the
//! parent's `add_*`/`remove*` methods, which keep both sides consistent.
//!
//! Every mutation is applied first and then announced with a [`SpecEvent`] on
//! the object's own signal, so observers never see half-applied state.
//! Renderers subscribe to the objects they draw.
//!
//! Label lookup ([`Axes::by_label`]) returns the most recently added artist
//! with that label when several share it. Uuid lookup is always unambiguous.

use crate::document::FieldValue;
use crate::error::{AppResult, RunVizError};
use crate::run::Run;
use crate::signal::{Signal, Subscription};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// What kind of change a [`SpecEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A child was added
    Insert,
    /// A child was removed
    Remove,
    /// A property or the data changed
    Update,
}

/// Structured change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecEvent {
    /// Insert / remove / update
    pub kind: ChangeKind,
    /// Uuid of the object that changed
    pub target: Uuid,
    /// Property or collection name ("title", "axes", "artists", "data", ...)
    pub field: String,
    /// New value; for inserts and removes, the child uuid
    pub value: serde_json::Value,
}

impl SpecEvent {
    fn new(kind: ChangeKind, target: Uuid, field: &str, value: serde_json::Value) -> Self {
        Self {
            kind,
            target,
            field: field.to_string(),
            value,
        }
    }
}

// =============================================================================
// FigureList
// =============================================================================

/// Ordered, observable collection of figures.
#[derive(Debug)]
pub struct FigureList {
    uuid: Uuid,
    figures: RwLock<Vec<Arc<Figure>>>,
    events: Signal<SpecEvent>,
}

impl Default for FigureList {
    fn default() -> Self {
        Self::new()
    }
}

impl FigureList {
    /// Empty list.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            figures: RwLock::new(Vec::new()),
            events: Signal::new(),
        }
    }

    /// Unique id
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Figures in insertion order
    pub fn figures(&self) -> Vec<Arc<Figure>> {
        self.figures.read().clone()
    }

    /// Number of figures
    pub fn len(&self) -> usize {
        self.figures.read().len()
    }

    /// Whether the list has no figures
    pub fn is_empty(&self) -> bool {
        self.figures.read().is_empty()
    }

    /// Add a figure. Adding the same figure twice is a no-op.
    pub fn add(&self, figure: Arc<Figure>) {
        {
            let mut figures = self.figures.write();
            if figures.iter().any(|f| f.uuid == figure.uuid) {
                return;
            }
            figures.push(Arc::clone(&figure));
        }
        self.events.emit(&SpecEvent::new(
            ChangeKind::Insert,
            self.uuid,
            "figures",
            json!(figure.uuid.to_string()),
        ));
    }

    /// Remove a figure; returns whether it was present.
    pub fn remove(&self, figure: &Figure) -> bool {
        let removed = {
            let mut figures = self.figures.write();
            let before = figures.len();
            figures.retain(|f| f.uuid != figure.uuid);
            before != figures.len()
        };
        if removed {
            self.events.emit(&SpecEvent::new(
                ChangeKind::Remove,
                self.uuid,
                "figures",
                json!(figure.uuid.to_string()),
            ));
        }
        removed
    }

    /// Figure with this id
    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<Figure>> {
        self.figures.read().iter().find(|f| f.uuid == uuid).cloned()
    }

    /// Observe insertions and removals.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SpecEvent) + Send + Sync + 'static,
    {
        self.events.connect(callback)
    }
}

// =============================================================================
// Figure
// =============================================================================

/// Top-level plot container.
#[derive(Debug)]
pub struct Figure {
    uuid: Uuid,
    title: RwLock<String>,
    short_title: RwLock<Option<String>>,
    axes: RwLock<Vec<Arc<Axes>>>,
    events: Signal<SpecEvent>,
}

impl Figure {
    /// Create an empty figure.
    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            title: RwLock::new(title.into()),
            short_title: RwLock::new(None),
            axes: RwLock::new(Vec::new()),
            events: Signal::new(),
        })
    }

    /// Unique id
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Current title
    pub fn title(&self) -> String {
        self.title.read().clone()
    }

    /// Set the title and notify observers.
    pub fn set_title(&self, title: impl Into<String>) {
        let title = title.into();
        *self.title.write() = title.clone();
        self.events
            .emit(&SpecEvent::new(ChangeKind::Update, self.uuid, "title", json!(title)));
    }

    /// Short title for tabs; falls back to the title.
    pub fn short_title(&self) -> String {
        self.short_title
            .read()
            .clone()
            .unwrap_or_else(|| self.title())
    }

    /// Set the short title and notify observers.
    pub fn set_short_title(&self, short_title: Option<String>) {
        *self.short_title.write() = short_title.clone();
        self.events.emit(&SpecEvent::new(
            ChangeKind::Update,
            self.uuid,
            "short_title",
            json!(short_title),
        ));
    }

    /// Axes in insertion order
    pub fn axes(&self) -> Vec<Arc<Axes>> {
        self.axes.read().clone()
    }

    /// Attach `axes` to this figure.
    pub fn add_axes(self: &Arc<Self>, axes: Arc<Axes>) -> AppResult<()> {
        {
            let mut parent = axes.figure.write();
            if parent.upgrade().is_some() {
                return Err(RunVizError::AlreadyAttached(format!(
                    "axes {} already belongs to a figure",
                    axes.uuid
                )));
            }
            *parent = Arc::downgrade(self);
        }
        self.axes.write().push(Arc::clone(&axes));
        self.events.emit(&SpecEvent::new(
            ChangeKind::Insert,
            self.uuid,
            "axes",
            json!(axes.uuid.to_string()),
        ));
        Ok(())
    }

    /// Detach `axes` from this figure.
    pub fn remove_axes(&self, axes: &Axes) -> AppResult<()> {
        let removed = {
            let mut children = self.axes.write();
            let before = children.len();
            children.retain(|a| a.uuid != axes.uuid);
            before != children.len()
        };
        if !removed {
            return Err(RunVizError::NotFound(format!(
                "axes {} is not in figure {}",
                axes.uuid, self.uuid
            )));
        }
        *axes.figure.write() = Weak::new();
        self.events.emit(&SpecEvent::new(
            ChangeKind::Remove,
            self.uuid,
            "axes",
            json!(axes.uuid.to_string()),
        ));
        Ok(())
    }

    /// Observe changes to this figure.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SpecEvent) + Send + Sync + 'static,
    {
        self.events.connect(callback)
    }
}

// =============================================================================
// Axes
// =============================================================================

/// Aspect ratio policy of an [`Axes`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    /// Fill available space
    Auto,
    /// One unit in x equals one unit in y
    Equal,
    /// Fixed y/x ratio
    Ratio(f64),
}

/// Display properties of an [`Axes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxesProperties {
    /// Axes title
    pub title: Option<String>,
    /// X axis label
    pub x_label: Option<String>,
    /// Y axis label
    pub y_label: Option<String>,
    /// X axis range
    pub x_limits: Option<(f64, f64)>,
    /// Y axis range
    pub y_limits: Option<(f64, f64)>,
    /// Aspect ratio constraint
    pub aspect: Option<Aspect>,
}

/// A set of artists sharing one coordinate system.
#[derive(Debug)]
pub struct Axes {
    uuid: Uuid,
    figure: RwLock<Weak<Figure>>,
    artists: RwLock<Vec<Arc<Artist>>>,
    properties: RwLock<AxesProperties>,
    events: Signal<SpecEvent>,
}

macro_rules! axes_setter {
    ($setter:ident, $field:ident, $ty:ty) => {
        #[doc = concat!("Set `", stringify!($field), "` and notify observers.")]
        pub fn $setter(&self, value: $ty) {
            self.properties.write().$field = value.clone();
            self.events.emit(&SpecEvent::new(
                ChangeKind::Update,
                self.uuid,
                stringify!($field),
                json!(value),
            ));
        }
    };
}

impl Axes {
    /// Create detached axes.
    pub fn new() -> Arc<Self> {
        Self::with_properties(AxesProperties::default())
    }

    /// Detached axes with initial properties.
    pub fn with_properties(properties: AxesProperties) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            figure: RwLock::new(Weak::new()),
            artists: RwLock::new(Vec::new()),
            properties: RwLock::new(properties),
            events: Signal::new(),
        })
    }

    /// Unique id
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Owning figure, if attached
    pub fn figure(&self) -> Option<Arc<Figure>> {
        self.figure.read().upgrade()
    }

    /// Snapshot of the display properties
    pub fn properties(&self) -> AxesProperties {
        self.properties.read().clone()
    }

    axes_setter!(set_title, title, Option<String>);
    axes_setter!(set_x_label, x_label, Option<String>);
    axes_setter!(set_y_label, y_label, Option<String>);
    axes_setter!(set_x_limits, x_limits, Option<(f64, f64)>);
    axes_setter!(set_y_limits, y_limits, Option<(f64, f64)>);
    axes_setter!(set_aspect, aspect, Option<Aspect>);

    /// Artists in insertion order
    pub fn artists(&self) -> Vec<Arc<Artist>> {
        self.artists.read().clone()
    }

    /// Attach `artist` to these axes.
    pub fn add_artist(self: &Arc<Self>, artist: Arc<Artist>) -> AppResult<()> {
        {
            let mut parent = artist.axes.write();
            if parent.upgrade().is_some() {
                return Err(RunVizError::AlreadyAttached(format!(
                    "artist '{}' ({}) already belongs to axes",
                    artist.label(),
                    artist.uuid
                )));
            }
            *parent = Arc::downgrade(self);
        }
        self.artists.write().push(Arc::clone(&artist));
        self.events.emit(&SpecEvent::new(
            ChangeKind::Insert,
            self.uuid,
            "artists",
            json!(artist.uuid.to_string()),
        ));
        Ok(())
    }

    /// Detach `artist`; error if it is not on these axes.
    pub fn remove(&self, artist: &Artist) -> AppResult<()> {
        if self.discard(artist) {
            Ok(())
        } else {
            Err(RunVizError::NotFound(format!(
                "artist {} is not on axes {}",
                artist.uuid, self.uuid
            )))
        }
    }

    /// Detach `artist` if present; returns whether it was.
    pub fn discard(&self, artist: &Artist) -> bool {
        let removed = {
            let mut children = self.artists.write();
            let before = children.len();
            children.retain(|a| a.uuid != artist.uuid);
            before != children.len()
        };
        if removed {
            *artist.axes.write() = Weak::new();
            self.events.emit(&SpecEvent::new(
                ChangeKind::Remove,
                self.uuid,
                "artists",
                json!(artist.uuid.to_string()),
            ));
        }
        removed
    }

    /// Most recently added artist with this label.
    pub fn by_label(&self, label: &str) -> Option<Arc<Artist>> {
        self.artists
            .read()
            .iter()
            .rev()
            .find(|a| a.label() == label)
            .cloned()
    }

    /// Artist with this id
    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<Artist>> {
        self.artists.read().iter().find(|a| a.uuid == uuid).cloned()
    }

    /// Observe changes to this axes.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SpecEvent) + Send + Sync + 'static,
    {
        self.events.connect(callback)
    }
}

// =============================================================================
// Artist
// =============================================================================

/// Where an artist's data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Run the data comes from
    pub run_uid: String,
    /// Stream the data comes from
    pub stream: String,
    /// X field; `None` means the row index
    pub x: Option<String>,
    /// Plotted field
    pub field: String,
}

/// Current data of an artist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtistData {
    /// Connected x/y series
    Line {
        /// X coordinates
        x: Vec<f64>,
        /// Y coordinates
        y: Vec<f64>,
    },
    /// Row-major 2-D array
    Image {
        /// (rows, cols)
        shape: (usize, usize),
        /// Pixel values, NaN where unset
        pixels: Vec<f64>,
    },
}

/// A drawable element: a line or an image.
#[derive(Debug)]
pub struct Artist {
    uuid: Uuid,
    label: RwLock<String>,
    style: RwLock<serde_json::Map<String, serde_json::Value>>,
    source: DataSource,
    axes: RwLock<Weak<Axes>>,
    data: RwLock<ArtistData>,
    events: Signal<SpecEvent>,
}

impl Artist {
    fn new(label: &str, source: DataSource, data: ArtistData) -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4(),
            label: RwLock::new(label.to_string()),
            style: RwLock::new(serde_json::Map::new()),
            source,
            axes: RwLock::new(Weak::new()),
            data: RwLock::new(data),
            events: Signal::new(),
        })
    }

    /// Empty line.
    pub fn line(label: &str, source: DataSource) -> Arc<Self> {
        Self::new(
            label,
            source,
            ArtistData::Line {
                x: Vec::new(),
                y: Vec::new(),
            },
        )
    }

    /// Image filled with NaN.
    ///
    /// Fails with `InvalidShape` if `shape` has more than [`MAX_IMAGE_PIXELS`]
    /// pixels or an empty dimension.
    pub fn image(label: &str, source: DataSource, shape: (usize, usize)) -> AppResult<Arc<Self>> {
        let n = pixel_count(&source.field, shape)?;
        Ok(Self::new(
            label,
            source,
            ArtistData::Image {
                shape,
                pixels: vec![f64::NAN; n],
            },
        ))
    }

    /// Line populated from the current content of `run`.
    ///
    /// Fails with `MissingField` if the stream or either field is absent.
    pub fn line_from_run(
        run: &Run,
        stream: &str,
        x: Option<&str>,
        y: &str,
        label: &str,
    ) -> AppResult<Arc<Self>> {
        let missing = |field: &str| RunVizError::MissingField {
            builder: "line".to_string(),
            run_uid: run.uid().to_string(),
            field: field.to_string(),
        };
        let s = run.stream(stream).ok_or_else(|| missing(stream))?;
        let ys = s.column(y).ok_or_else(|| missing(y))?.to_f64();
        let xs = match x {
            Some(x) => s.column(x).ok_or_else(|| missing(x))?.to_f64(),
            None => (0..ys.len()).map(|i| i as f64).collect(),
        };
        let source = DataSource {
            run_uid: run.uid().to_string(),
            stream: stream.to_string(),
            x: x.map(str::to_string),
            field: y.to_string(),
        };
        Ok(Self::new(label, source, ArtistData::Line { x: xs, y: ys }))
    }

    /// Image showing the latest frame of an array field of `run`.
    ///
    /// The frame shape comes from the field's data key; a 1-D shape is drawn
    /// as a single row.
    pub fn image_from_run(run: &Run, stream: &str, field: &str, label: &str) -> AppResult<Arc<Self>> {
        let missing = || RunVizError::MissingField {
            builder: "image".to_string(),
            run_uid: run.uid().to_string(),
            field: field.to_string(),
        };
        let s = run.stream(stream).ok_or_else(missing)?;
        let key = s.data_key(field).ok_or_else(missing)?;
        let shape = frame_shape(&key.shape);
        let source = DataSource {
            run_uid: run.uid().to_string(),
            stream: stream.to_string(),
            x: None,
            field: field.to_string(),
        };
        let artist = Self::image(label, source, shape)?;
        let latest = s.len().checked_sub(1).and_then(|last| s.value(field, last));
        if let Some(FieldValue::Array(frame)) = latest {
            artist.set_frame(&frame);
        }
        Ok(artist)
    }

    /// Unique id
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Current label
    pub fn label(&self) -> String {
        self.label.read().clone()
    }

    /// Set the label and notify observers.
    pub fn set_label(&self, label: impl Into<String>) {
        let label = label.into();
        *self.label.write() = label.clone();
        self.events
            .emit(&SpecEvent::new(ChangeKind::Update, self.uuid, "label", json!(label)));
    }

    /// Style options (color, marker, ...) as understood by the renderer
    pub fn style(&self) -> serde_json::Map<String, serde_json::Value> {
        self.style.read().clone()
    }

    /// Set one style option and notify observers.
    pub fn set_style(&self, key: &str, value: serde_json::Value) {
        self.style.write().insert(key.to_string(), value.clone());
        self.events.emit(&SpecEvent::new(
            ChangeKind::Update,
            self.uuid,
            "style",
            json!({ key: value }),
        ));
    }

    /// Run, stream and fields rendered
    pub fn data_source(&self) -> &DataSource {
        &self.source
    }

    /// Owning axes, if attached
    pub fn axes(&self) -> Option<Arc<Axes>> {
        self.axes.read().upgrade()
    }

    /// Snapshot of the current data
    pub fn data(&self) -> ArtistData {
        self.data.read().clone()
    }

    /// Number of points (lines) or pixels (images)
    pub fn data_len(&self) -> usize {
        match &*self.data.read() {
            ArtistData::Line { y, .. } => y.len(),
            ArtistData::Image { pixels, .. } => pixels.len(),
        }
    }

    /// Append one point to a line. Ignored for images.
    pub fn push_point(&self, x: f64, y: f64) {
        {
            let mut data = self.data.write();
            let ArtistData::Line { x: xs, y: ys } = &mut *data else {
                tracing::debug!(artist = %self.uuid, "push_point on an image artist ignored");
                return;
            };
            xs.push(x);
            ys.push(y);
        }
        self.events.emit(&SpecEvent::new(
            ChangeKind::Update,
            self.uuid,
            "data",
            json!({ "append": [x, y] }),
        ));
    }

    /// Replace the whole image with `frame`; extra values are dropped and
    /// missing ones become NaN. Ignored for lines.
    pub fn set_frame(&self, frame: &[f64]) {
        {
            let mut data = self.data.write();
            let ArtistData::Image { pixels, .. } = &mut *data else {
                return;
            };
            let n = pixels.len();
            pixels.clear();
            pixels.extend(frame.iter().copied().take(n));
            pixels.resize(n, f64::NAN);
        }
        self.events.emit(&SpecEvent::new(
            ChangeKind::Update,
            self.uuid,
            "data",
            json!({ "frame": frame.len() }),
        ));
    }

    /// Set one image pixel. Out-of-range positions are ignored.
    pub fn set_pixel(&self, row: usize, col: usize, value: f64) {
        {
            let mut data = self.data.write();
            let ArtistData::Image { shape, pixels } = &mut *data else {
                return;
            };
            if row >= shape.0 || col >= shape.1 {
                return;
            }
            pixels[row * shape.1 + col] = value;
        }
        self.events.emit(&SpecEvent::new(
            ChangeKind::Update,
            self.uuid,
            "data",
            json!({ "pixel": [row, col, value] }),
        ));
    }

    /// Observe changes to this artist.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SpecEvent) + Send + Sync + 'static,
    {
        self.events.connect(callback)
    }
}

/// Largest image an artist will allocate.
pub const MAX_IMAGE_PIXELS: usize = 1 << 24;

/// Pixel count of `shape`, rejecting empty, overflowing or oversized images.
pub fn pixel_count(field: &str, shape: (usize, usize)) -> AppResult<usize> {
    let invalid = |reason: String| RunVizError::InvalidShape {
        field: field.to_string(),
        reason,
    };
    if shape.0 == 0 || shape.1 == 0 {
        return Err(invalid(format!("{shape:?} has an empty dimension")));
    }
    match shape.0.checked_mul(shape.1) {
        Some(n) if n <= MAX_IMAGE_PIXELS => Ok(n),
        _ => Err(invalid(format!(
            "{shape:?} exceeds {MAX_IMAGE_PIXELS} pixels"
        ))),
    }
}

/// 2-D frame shape from a data key shape.
pub(crate) fn frame_shape(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (1, *n),
        [rows, cols, ..] => (*rows, *cols),
    }
}
