//! CLI entry point for run_viz.
//!
//! Subscribes to a remote document publisher, reconstructs runs and keeps the
//! configured plot specifications up to date. Without a renderer attached it
//! logs a summary of every figure when a run completes.
//!
//! ```bash
//! run_viz --config plots.toml --endpoint tcp://beamline:5578
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use run_viz::builders::{Auto, ImagesConfig, LinesConfig, RasteredImagesConfig};
use run_viz::plot_specs::ChangeKind;
use run_viz::{
    stream_documents_into_runs, AutoImages, AutoLines, AutoRasteredImages, Diagnostics,
    DocumentBus, FigureList, Images, Lines, PlotBuilder, RasteredImages, RemoteDispatcher,
    RunAggregator, RunVizConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "run_viz")]
#[command(about = "Stream experiment documents into live plot specifications", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote publisher endpoint (overrides the configuration)
    #[arg(long)]
    endpoint: Option<String>,

    /// Subscription topic prefix (overrides the configuration)
    #[arg(long)]
    topic: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Every configured builder, each fed automatically by the aggregator.
struct Plots {
    lines: Vec<AutoLines>,
    images: Vec<AutoImages>,
    rastered: Vec<AutoRasteredImages>,
}

impl Plots {
    fn build(config: &RunVizConfig, aggregator: &RunAggregator, diagnostics: &Diagnostics) -> Result<Self> {
        let lines = config
            .lines
            .iter()
            .cloned()
            .map(|c: LinesConfig| Ok(Auto::new(Lines::new(c, diagnostics)?, aggregator)))
            .collect::<Result<Vec<_>>>()?;
        let images = config
            .images
            .iter()
            .cloned()
            .map(|c: ImagesConfig| Ok(Auto::new(Images::new(c, diagnostics)?, aggregator)))
            .collect::<Result<Vec<_>>>()?;
        let rastered = config
            .rastered_images
            .iter()
            .cloned()
            .map(|c: RasteredImagesConfig| Ok(Auto::new(RasteredImages::new(c, diagnostics)?, aggregator)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            lines,
            images,
            rastered,
        })
    }

    fn builders(&self) -> Vec<&dyn PlotBuilder> {
        let mut builders: Vec<&dyn PlotBuilder> = Vec::new();
        builders.extend(self.lines.iter().map(|a| &**a as &dyn PlotBuilder));
        builders.extend(self.images.iter().map(|a| &**a as &dyn PlotBuilder));
        builders.extend(self.rastered.iter().map(|a| &**a as &dyn PlotBuilder));
        builders
    }
}

fn log_summary(figures: &FigureList) {
    for figure in figures.figures() {
        let axes = figure.axes();
        let artists: usize = axes.iter().map(|a| a.artists().len()).sum();
        tracing::info!(
            figure = %figure.title(),
            axes = axes.len(),
            artists,
            "figure state"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RunVizConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RunVizConfig::load().context("loading configuration")?,
    };
    if let Some(endpoint) = cli.endpoint {
        config.dispatcher.endpoint = endpoint;
    }
    if let Some(topic) = cli.topic {
        config.dispatcher.topic = topic;
    }
    config.validate()?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.application.log_level)),
        )
        .init();

    tracing::info!(
        name = %config.application.name,
        endpoint = %config.dispatcher.endpoint,
        builders = config.builder_count(),
        "starting"
    );

    let diagnostics = Diagnostics::new();
    let bus = DocumentBus::new(diagnostics.clone());
    let aggregator = stream_documents_into_runs(&bus, config.aggregator.clone());

    let plots = Plots::build(&config, &aggregator, &diagnostics)?;
    let figures = Arc::new(FigureList::new());
    for builder in plots.builders() {
        figures.add(builder.figure());
    }
    let _figure_log = figures.subscribe(|event| {
        if event.kind == ChangeKind::Insert {
            tracing::debug!(figure = %event.value, "figure added");
        }
    });

    let summary_figures = Arc::clone(&figures);
    let _summary = aggregator.subscribe_run_completed(move |run| {
        tracing::info!(run_uid = run.uid(), "run completed");
        log_summary(&summary_figures);
    });

    let mut dispatcher = RemoteDispatcher::new(config.dispatcher.clone(), &diagnostics)?;
    dispatcher.start()?;

    tokio::select! {
        published = dispatcher.forward(&bus) => {
            tracing::warn!(published, state = ?dispatcher.state(), "dispatcher loop ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            tracing::info!("shutting down");
        }
    }

    dispatcher.stop();
    let remaining = dispatcher.pump(&bus);
    tracing::info!(remaining, delivered = bus.delivered_count(), "stopped");
    log_summary(&figures);
    Ok(())
}
