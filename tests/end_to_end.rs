//! Documents published on the bus end up as runs and plot specs.

use parking_lot::Mutex;
use run_viz::builders::{ImagesConfig, LinesConfig, RasteredImagesConfig};
use run_viz::document::{DataKey, DescriptorDoc, EventDoc, StartDoc, StopDoc};
use run_viz::plot_specs::{ArtistData, ChangeKind, SpecEvent};
use run_viz::{
    stream_documents_into_runs, AggregatorConfig, AutoImages, AutoLines, AutoRasteredImages,
    Diagnostics, DocumentBus, Images, Lines, PlotBuilder, RasteredImages, RunVizError,
};
use std::sync::Arc;

fn publish_scan(bus: &DocumentBus, uid: &str, points: &[(f64, f64)]) {
    bus.publish(StartDoc::with_uid(uid, "scan").with_metadata("scan_id", 1).into());
    bus.publish(
        DescriptorDoc::new(uid, "primary")
            .with_data_key("motor", DataKey::scalar("motor", "mm"))
            .with_data_key("det", DataKey::scalar("det", "counts"))
            .into(),
    );
    for (i, (x, y)) in points.iter().enumerate() {
        bus.publish(
            EventDoc::new(uid, "primary", i as u64 + 1)
                .with_datum("motor", *x)
                .with_datum("det", *y)
                .into(),
        );
    }
    bus.publish(StopDoc::success(uid).into());
}

#[test]
fn lines_follow_a_live_scan() {
    let bus = DocumentBus::default();
    let aggregator = stream_documents_into_runs(&bus, AggregatorConfig::default());
    let lines = AutoLines::new(
        Lines::new(LinesConfig::new(Some("motor"), &["det"]), bus.diagnostics()).unwrap(),
        &aggregator,
    );

    let events: Arc<Mutex<Vec<SpecEvent>>> = Arc::default();
    let e = events.clone();
    let _watch = lines.figure().subscribe(move |event| e.lock().push(event.clone()));

    publish_scan(&bus, "A", &[(0.0, 1.0), (1.0, 4.0), (2.0, 9.0)]);

    let axes = lines.figure().axes();
    assert_eq!(axes.len(), 1);
    let artist = &axes[0].artists()[0];
    assert_eq!(
        artist.data(),
        ArtistData::Line {
            x: vec![0.0, 1.0, 2.0],
            y: vec![1.0, 4.0, 9.0]
        }
    );
    assert!(events
        .lock()
        .iter()
        .any(|e| e.kind == ChangeKind::Insert && e.field == "axes"));
    // Completed runs stay on the plot.
    assert_eq!(lines.runs().len(), 1);
    assert!(lines.runs()[0].is_closed());
}

#[test]
fn builders_skip_runs_without_their_fields() {
    let bus = DocumentBus::default();
    let mut diagnostics = bus.diagnostics().subscribe();
    let aggregator = stream_documents_into_runs(&bus, AggregatorConfig::default());
    let images = AutoImages::new(
        Images::new(ImagesConfig::new("frame"), bus.diagnostics()).unwrap(),
        &aggregator,
    );
    let lines = AutoLines::new(
        Lines::new(LinesConfig::new(None, &["det"]), bus.diagnostics()).unwrap(),
        &aggregator,
    );

    publish_scan(&bus, "A", &[(0.0, 1.0)]);

    assert!(images.runs().is_empty());
    assert!(images.figure().axes().is_empty());
    assert_eq!(lines.runs().len(), 1);

    let mut missing = 0;
    while let Ok(diag) = diagnostics.try_recv() {
        if matches!(*diag.error, RunVizError::MissingField { .. }) {
            missing += 1;
        }
    }
    assert_eq!(missing, 1);
}

#[test]
fn raster_and_lines_share_one_stream() {
    let bus = DocumentBus::new(Diagnostics::new());
    let aggregator = stream_documents_into_runs(&bus, AggregatorConfig::default());
    let raster = AutoRasteredImages::new(
        RasteredImages::new(
            RasteredImagesConfig::new("det", (2, 2)).snaking(true),
            bus.diagnostics(),
        )
        .unwrap(),
        &aggregator,
    );

    publish_scan(&bus, "A", &[(0.0, 1.0), (1.0, 2.0), (2.0, 3.0), (3.0, 4.0)]);

    let artist = raster.artists_for("A").remove(0);
    assert_eq!(
        artist.data(),
        ArtistData::Image {
            shape: (2, 2),
            pixels: vec![1.0, 2.0, 4.0, 3.0]
        }
    );
}

#[test]
fn violations_do_not_disturb_other_runs() {
    let bus = DocumentBus::default();
    let mut diagnostics = bus.diagnostics().subscribe();
    let aggregator = stream_documents_into_runs(&bus, AggregatorConfig::default());

    bus.publish(StopDoc::success("ghost").into());
    publish_scan(&bus, "A", &[(0.0, 1.0)]);
    bus.publish(EventDoc::new("A", "primary", 9).with_datum("det", 1.0).into());

    let violations: Vec<String> = std::iter::from_fn(|| diagnostics.try_recv().ok())
        .filter(|d| matches!(*d.error, RunVizError::ProtocolViolation { .. }))
        .map(|d| d.error.to_string())
        .collect();
    assert_eq!(violations.len(), 2);
    assert!(violations[0].contains("before start"));
    assert!(violations[1].contains("already closed"));
    assert!(aggregator.open_runs().is_empty());
}

#[test]
fn oversized_image_skips_only_the_image_builder() {
    let bus = DocumentBus::default();
    let mut diagnostics = bus.diagnostics().subscribe();
    let aggregator = stream_documents_into_runs(&bus, AggregatorConfig::default());
    let images = AutoImages::new(
        Images::new(ImagesConfig::new("frame"), bus.diagnostics()).unwrap(),
        &aggregator,
    );
    let lines = AutoLines::new(
        Lines::new(LinesConfig::new(None, &["det"]), bus.diagnostics()).unwrap(),
        &aggregator,
    );

    bus.publish(StartDoc::with_uid("A", "scan").into());
    bus.publish(
        DescriptorDoc::new("A", "primary")
            .with_data_key("frame", DataKey::array("cam", vec![usize::MAX / 2 + 1, 4]))
            .with_data_key("det", DataKey::scalar("det", "counts"))
            .into(),
    );
    bus.publish(EventDoc::new("A", "primary", 1).with_datum("det", 7.0).into());

    assert!(!images.is_attached("A"));
    assert!(images.runs().is_empty());
    assert!(lines.is_attached("A"));
    assert_eq!(
        lines.artists_for("A")[0].data(),
        ArtistData::Line {
            x: vec![0.0],
            y: vec![7.0]
        }
    );

    let diag = diagnostics.try_recv().unwrap();
    assert_eq!(diag.component, "images");
    assert!(matches!(*diag.error, RunVizError::InvalidShape { ref field, .. } if field == "frame"));
}
