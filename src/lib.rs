//! Core library for the run_viz application.
//!
//! Streams experiment documents into structured runs and drives
//! renderer-agnostic plot specifications:
//!
//! ```text
//! remote bytes ─► RemoteDispatcher ─► DocumentBus ─► RunAggregator ─► Run / Stream
//!                                                                         │
//!                       FigureList ◄─ Figure ◄─ Axes ◄─ Artist ◄─ plot builders
//! ```
//!
//! The library has no rendering code. Renderers subscribe to the plot spec
//! objects in [`plot_specs`] and draw whatever they describe.

pub mod aggregator;
pub mod builders;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod plot_specs;
pub mod run;
pub mod signal;

pub use aggregator::{stream_documents_into_runs, AggregatorConfig, RunAggregator};
pub use builders::{
    AutoImages, AutoLines, AutoRasteredImages, Images, Lines, PlotBuilder, RasteredImages,
};
pub use bus::DocumentBus;
pub use config::RunVizConfig;
pub use dispatcher::{DispatcherConfig, DispatcherState, RemoteDispatcher};
pub use document::{Document, DocumentKind};
pub use error::{AppResult, Diagnostics, RunVizError};
pub use plot_specs::{Artist, Axes, Figure, FigureList};
pub use run::{Run, Stream};
