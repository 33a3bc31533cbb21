//! Remote dispatcher: relays documents published by a remote process into the
//! local [`DocumentBus`].
//!
//! The receive loop runs on its own thread with a single-threaded tokio
//! runtime, so `start()` returns immediately and a slow or silent endpoint
//! never blocks the bus. Decoded documents cross back to the owner through an
//! unbounded channel; the owner publishes them with [`RemoteDispatcher::pump`]
//! (non-blocking) or [`RemoteDispatcher::forward`] (async), keeping all bus
//! delivery on the owner's thread.
//!
//! # Wire format
//!
//! Each message is multipart: `[topic, payload...]`. A single-frame message is
//! treated as a payload without topic. Every payload decodes to a
//! [`WireFrame`]: either a whole document, or one half of an event split into
//! an [`EventHeader`] and its [`EventValues`]. The two halves are matched by
//! event uid, in either order and across messages.
//!
//! # Failure handling
//!
//! - A frame that does not decode is reported as `Decode` and dropped.
//! - A transport error moves the dispatcher to [`DispatcherState::Failed`]
//!   and ends the loop. Start a new dispatcher to reconnect.

use crate::bus::DocumentBus;
use crate::document::{Document, EventDoc, FieldValue};
use crate::error::{AppResult, Diagnostics, RunVizError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use zeromq::{Socket, SocketRecv, SubSocket};

// =============================================================================
// Configuration
// =============================================================================

fn default_endpoint() -> String {
    "tcp://127.0.0.1:5578".to_string()
}

fn default_recv_timeout_ms() -> u64 {
    500
}

fn default_max_pending_fragments() -> usize {
    1024
}

/// Payload encoding on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// MessagePack with named fields
    #[default]
    Msgpack,
    /// UTF-8 JSON
    Json,
}

impl Encoding {
    /// Decoder for this encoding.
    pub fn decoder(self) -> Box<dyn DocumentDecoder> {
        match self {
            Encoding::Msgpack => Box::new(MsgpackDecoder),
            Encoding::Json => Box::new(JsonDecoder),
        }
    }

    /// Encode one frame; used by publishers and tests.
    pub fn encode(self, frame: &WireFrame) -> AppResult<Vec<u8>> {
        match self {
            Encoding::Msgpack => rmp_serde::to_vec_named(frame)
                .map_err(|e| RunVizError::Decode(format!("msgpack encode: {e}"))),
            Encoding::Json => serde_json::to_vec(frame)
                .map_err(|e| RunVizError::Decode(format!("json encode: {e}"))),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// ZeroMQ endpoint of the remote publisher
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Subscription prefix; empty receives everything
    #[serde(default)]
    pub topic: String,
    /// Payload encoding
    #[serde(default)]
    pub encoding: Encoding,
    /// Idle interval of the receive loop
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    /// Incomplete split events kept while waiting for their other half
    #[serde(default = "default_max_pending_fragments")]
    pub max_pending_fragments: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            topic: String::new(),
            encoding: Encoding::default(),
            recv_timeout_ms: default_recv_timeout_ms(),
            max_pending_fragments: default_max_pending_fragments(),
        }
    }
}

impl DispatcherConfig {
    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.endpoint.is_empty() {
            return Err(RunVizError::Configuration(
                "dispatcher.endpoint must not be empty".to_string(),
            ));
        }
        if self.recv_timeout_ms == 0 {
            return Err(RunVizError::Configuration(
                "dispatcher.recv_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_pending_fragments == 0 {
            return Err(RunVizError::Configuration(
                "dispatcher.max_pending_fragments must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Wire frames
// =============================================================================

/// Metadata half of a split event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Event uid shared by both halves
    pub uid: String,
    /// Run the event belongs to
    pub run_uid: String,
    /// Stream name
    pub stream: String,
    /// Sequence number within the stream
    pub seq_num: u64,
    /// Event time in nanoseconds
    pub time_ns: u64,
}

/// Values half of a split event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventValues {
    /// Event uid shared by both halves
    pub uid: String,
    /// Field values
    pub data: BTreeMap<String, FieldValue>,
    /// Per-field timestamps in nanoseconds
    #[serde(default)]
    pub timestamps: BTreeMap<String, u64>,
}

/// Half of an event sent in two frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// Event metadata without values
    EventHeader(EventHeader),
    /// Event values without metadata
    EventValues(EventValues),
}

impl Fragment {
    fn uid(&self) -> &str {
        match self {
            Fragment::EventHeader(h) => &h.uid,
            Fragment::EventValues(v) => &v.uid,
        }
    }
}

/// One decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireFrame {
    /// A complete document
    Document(Document),
    /// Half of a split event
    Fragment(Fragment),
}

impl EventDoc {
    /// Split into header and values, as some publishers send events.
    pub fn split(self) -> (EventHeader, EventValues) {
        (
            EventHeader {
                uid: self.uid.clone(),
                run_uid: self.run_uid,
                stream: self.stream,
                seq_num: self.seq_num,
                time_ns: self.time_ns,
            },
            EventValues {
                uid: self.uid,
                data: self.data,
                timestamps: self.timestamps,
            },
        )
    }
}

fn join(header: EventHeader, values: EventValues) -> EventDoc {
    EventDoc {
        uid: header.uid,
        run_uid: header.run_uid,
        stream: header.stream,
        seq_num: header.seq_num,
        time_ns: header.time_ns,
        data: values.data,
        timestamps: values.timestamps,
    }
}

/// Turns payload bytes into a [`WireFrame`].
pub trait DocumentDecoder: Send {
    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> AppResult<WireFrame>;
}

/// MessagePack payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackDecoder;

impl DocumentDecoder for MsgpackDecoder {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn decode(&self, payload: &[u8]) -> AppResult<WireFrame> {
        rmp_serde::from_slice(payload).map_err(|e| RunVizError::Decode(format!("msgpack: {e}")))
    }
}

/// JSON payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl DocumentDecoder for JsonDecoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: &[u8]) -> AppResult<WireFrame> {
        serde_json::from_slice(payload).map_err(|e| RunVizError::Decode(format!("json: {e}")))
    }
}

/// Result of feeding one fragment to a [`Reassembler`].
#[derive(Debug, Default)]
pub struct Reassembled {
    /// Event completed by this fragment
    pub complete: Option<EventDoc>,
    /// Uids of incomplete events dropped to stay within capacity
    pub evicted: Vec<String>,
}

/// Matches event headers with their values.
#[derive(Debug)]
pub struct Reassembler {
    capacity: usize,
    pending: HashMap<String, Fragment>,
    order: VecDeque<String>,
}

impl Reassembler {
    /// Hold at most `capacity` incomplete events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Incomplete events currently held
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add a fragment, completing its event if the other half is pending.
    pub fn accept(&mut self, fragment: Fragment) -> Reassembled {
        let uid = fragment.uid().to_string();
        let mut result = Reassembled::default();

        match (self.pending.remove(&uid), fragment) {
            (Some(Fragment::EventHeader(h)), Fragment::EventValues(v))
            | (Some(Fragment::EventValues(v)), Fragment::EventHeader(h)) => {
                self.order.retain(|u| u != &uid);
                result.complete = Some(join(h, v));
                return result;
            }
            (Some(_), fragment) => {
                tracing::debug!(event_uid = %uid, "duplicate fragment replaces the held one");
                self.pending.insert(uid, fragment);
                return result;
            }
            (None, fragment) => {
                self.pending.insert(uid.clone(), fragment);
                self.order.push_back(uid);
            }
        }

        while self.pending.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.pending.remove(&oldest).is_some() {
                result.evicted.push(oldest);
            }
        }
        result
    }
}

// =============================================================================
// Frame sources
// =============================================================================

/// A transport delivering multipart messages.
#[async_trait]
pub trait FrameSource: Send {
    /// Establish the connection.
    async fn connect(&mut self) -> AppResult<()>;

    /// Next message. An error means the transport is gone.
    async fn recv(&mut self) -> AppResult<Vec<Bytes>>;
}

/// ZeroMQ SUB socket.
pub struct ZmqSource {
    endpoint: String,
    topic: String,
    socket: Option<SubSocket>,
}

impl std::fmt::Debug for ZmqSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqSource")
            .field("endpoint", &self.endpoint)
            .field("topic", &self.topic)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

impl ZmqSource {
    /// SUB socket for `endpoint`, subscribed to `topic`.
    pub fn new(endpoint: &str, topic: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            topic: topic.to_string(),
            socket: None,
        }
    }
}

#[async_trait]
impl FrameSource for ZmqSource {
    async fn connect(&mut self) -> AppResult<()> {
        let mut socket = SubSocket::new();
        socket.connect(&self.endpoint).await.map_err(|e| {
            RunVizError::ConnectionFailure(format!("ZMQ SUB connect to {}: {}", self.endpoint, e))
        })?;
        socket
            .subscribe(&self.topic)
            .await
            .map_err(|e| RunVizError::ConnectionFailure(format!("ZMQ subscribe: {e}")))?;
        tracing::info!(endpoint = %self.endpoint, topic = %self.topic, "ZMQ SUB socket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<Vec<Bytes>> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| RunVizError::ConnectionFailure("ZMQ socket not connected".to_string()))?;
        let message = socket
            .recv()
            .await
            .map_err(|e| RunVizError::ConnectionFailure(format!("ZMQ receive: {e}")))?;
        Ok(message.into_vec())
    }
}

/// In-process source fed through a channel. Dropping every sender closes it.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
}

impl ChannelSource {
    /// In-process source and the sender that feeds it.
    pub fn new() -> (mpsc::UnboundedSender<Vec<Bytes>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn connect(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn recv(&mut self) -> AppResult<Vec<Bytes>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| RunVizError::ConnectionFailure("frame source closed".to_string()))
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Lifecycle of a [`RemoteDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherState {
    /// Created, not started
    Idle,
    /// Receive thread started, connecting
    Connecting,
    /// Receiving frames
    Running,
    /// Stopped on request
    Stopped,
    /// Transport failed; terminal
    Failed(String),
}

impl DispatcherState {
    /// Whether the receive loop has exited for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

struct Worker {
    source: Box<dyn FrameSource>,
    decoder: Box<dyn DocumentDecoder>,
    reassembler: Reassembler,
    documents: mpsc::UnboundedSender<Document>,
    state: watch::Sender<DispatcherState>,
    shutdown: watch::Receiver<bool>,
    diagnostics: Diagnostics,
    idle: Duration,
}

enum Flow {
    Continue,
    Exit(DispatcherState),
}

/// Resolves once shutdown is requested or the dispatcher handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Worker {
    async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        let connected = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => None,
            result = self.source.connect() => Some(result),
        };
        match connected {
            None => {
                self.state.send_replace(DispatcherState::Stopped);
                return;
            }
            Some(Err(err)) => {
                let reason = err.to_string();
                self.diagnostics.report("dispatcher", err);
                self.state.send_replace(DispatcherState::Failed(reason));
                return;
            }
            Some(Ok(())) => {
                self.state.send_replace(DispatcherState::Running);
            }
        }

        let mut received = 0u64;
        let final_state = loop {
            let flow = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => Flow::Exit(DispatcherState::Stopped),
                message = self.source.recv() => match message {
                    Ok(frames) => {
                        received += 1;
                        self.handle_message(frames)
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        self.diagnostics.report("dispatcher", err);
                        Flow::Exit(DispatcherState::Failed(reason))
                    }
                },
                _ = tokio::time::sleep(self.idle) => {
                    tracing::trace!(received, "dispatcher idle");
                    Flow::Continue
                }
            };
            if let Flow::Exit(state) = flow {
                break state;
            }
        };

        tracing::info!(received, state = ?final_state, "dispatcher loop exited");
        self.state.send_replace(final_state);
    }

    fn handle_message(&mut self, mut frames: Vec<Bytes>) -> Flow {
        let (topic, payloads) = match frames.len() {
            0 => {
                self.diagnostics
                    .report("dispatcher", RunVizError::Decode("empty message".to_string()));
                return Flow::Continue;
            }
            1 => (Bytes::new(), frames),
            _ => {
                let topic = frames.remove(0);
                (topic, frames)
            }
        };

        for payload in payloads {
            let frame = match self.decoder.decode(&payload) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(
                        topic = %String::from_utf8_lossy(&topic),
                        bytes = payload.len(),
                        decoder = self.decoder.name(),
                        "dropping undecodable frame"
                    );
                    self.diagnostics.report("dispatcher", err);
                    continue;
                }
            };
            let document = match frame {
                WireFrame::Document(document) => Some(document),
                WireFrame::Fragment(fragment) => {
                    let Reassembled { complete, evicted } = self.reassembler.accept(fragment);
                    for uid in evicted {
                        self.diagnostics.report(
                            "dispatcher",
                            RunVizError::Decode(format!(
                                "incomplete event '{uid}' dropped; too many pending fragments"
                            )),
                        );
                    }
                    complete.map(Document::from)
                }
            };
            if let Some(document) = document {
                if self.documents.send(document).is_err() {
                    tracing::info!("document receiver dropped, stopping dispatcher");
                    return Flow::Exit(DispatcherState::Stopped);
                }
            }
        }
        Flow::Continue
    }
}

/// Bridge from a remote publisher to the local bus.
pub struct RemoteDispatcher {
    config: DispatcherConfig,
    pending_worker: Option<Worker>,
    documents: mpsc::UnboundedReceiver<Document>,
    state: watch::Receiver<DispatcherState>,
    shutdown: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RemoteDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDispatcher")
            .field("endpoint", &self.config.endpoint)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RemoteDispatcher {
    /// Dispatcher reading from the configured ZeroMQ endpoint.
    pub fn new(config: DispatcherConfig, diagnostics: &Diagnostics) -> AppResult<Self> {
        let source = ZmqSource::new(&config.endpoint, &config.topic);
        Self::with_source(config, Box::new(source), diagnostics)
    }

    /// Dispatcher reading from any frame source.
    pub fn with_source(
        config: DispatcherConfig,
        source: Box<dyn FrameSource>,
        diagnostics: &Diagnostics,
    ) -> AppResult<Self> {
        config.validate()?;
        let (documents_tx, documents) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(DispatcherState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            source,
            decoder: config.encoding.decoder(),
            reassembler: Reassembler::new(config.max_pending_fragments),
            documents: documents_tx,
            state: state_tx,
            shutdown: shutdown_rx,
            diagnostics: diagnostics.clone(),
            idle: Duration::from_millis(config.recv_timeout_ms),
        };
        Ok(Self {
            config,
            pending_worker: Some(worker),
            documents,
            state,
            shutdown,
            thread: None,
        })
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> DispatcherState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.clone()
    }

    /// Spawn the receive thread. Returns without waiting for the connection.
    pub fn start(&mut self) -> AppResult<()> {
        let worker = self.pending_worker.take().ok_or_else(|| {
            RunVizError::Configuration("dispatcher was already started".to_string())
        })?;
        worker.state.send_replace(DispatcherState::Connecting);
        let endpoint = self.config.endpoint.clone();

        let thread = std::thread::Builder::new()
            .name("run-viz-dispatcher".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let err = RunVizError::ConnectionFailure(format!(
                            "cannot build dispatcher runtime: {e}"
                        ));
                        worker
                            .state
                            .send_replace(DispatcherState::Failed(err.to_string()));
                        worker.diagnostics.report("dispatcher", err);
                        return;
                    }
                };
                tracing::info!(%endpoint, "dispatcher thread started");
                runtime.block_on(worker.run());
            })
            .map_err(|e| {
                RunVizError::ConnectionFailure(format!("cannot spawn dispatcher thread: {e}"))
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Publish every document received so far. Never blocks.
    pub fn pump(&mut self, bus: &DocumentBus) -> usize {
        let mut published = 0;
        while let Ok(document) = self.documents.try_recv() {
            bus.publish(document);
            published += 1;
        }
        published
    }

    /// Publish documents as they arrive until the receive loop exits.
    pub async fn forward(&mut self, bus: &DocumentBus) -> usize {
        let mut published = 0;
        while let Some(document) = self.documents.recv().await {
            bus.publish(document);
            published += 1;
        }
        published
    }

    /// Next received document, if the loop is still able to produce one.
    pub async fn next_document(&mut self) -> Option<Document> {
        self.documents.recv().await
    }

    /// End the receive loop and release the connection.
    ///
    /// Documents already received stay available to [`pump`](Self::pump).
    pub fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(worker) = self.pending_worker.take() {
            worker.state.send_replace(DispatcherState::Stopped);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for RemoteDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{StartDoc, StopDoc};

    fn message(encoding: Encoding, frames: &[WireFrame]) -> Vec<Bytes> {
        let mut parts = vec![Bytes::from_static(b"docs")];
        for frame in frames {
            parts.push(Bytes::from(encoding.encode(frame).unwrap()));
        }
        parts
    }

    fn doc(document: impl Into<Document>) -> WireFrame {
        WireFrame::Document(document.into())
    }

    async fn wait_terminal(dispatcher: &RemoteDispatcher) -> DispatcherState {
        let mut state = dispatcher.watch_state();
        let reached = state.wait_for(|s| s.is_terminal()).await.unwrap();
        reached.clone()
    }

    #[test]
    fn test_reassembles_in_either_order() {
        let event = EventDoc::new("A", "primary", 1).with_datum("det", 2.5);
        let (header, values) = event.clone().split();

        let mut reassembler = Reassembler::new(8);
        assert!(reassembler
            .accept(Fragment::EventValues(values.clone()))
            .complete
            .is_none());
        let done = reassembler.accept(Fragment::EventHeader(header.clone()));
        assert_eq!(done.complete, Some(event.clone()));
        assert_eq!(reassembler.pending(), 0);

        assert!(reassembler.accept(Fragment::EventHeader(header)).complete.is_none());
        assert_eq!(reassembler.accept(Fragment::EventValues(values)).complete, Some(event));
    }

    #[test]
    fn test_reassembler_evicts_oldest() {
        let mut reassembler = Reassembler::new(2);
        for seq in 1..=3 {
            let (header, _) = EventDoc::new("A", "primary", seq).split();
            let uid = header.uid.clone();
            let result = reassembler.accept(Fragment::EventHeader(header));
            if seq == 3 {
                assert_eq!(result.evicted.len(), 1);
                assert_ne!(result.evicted[0], uid);
            }
        }
        assert_eq!(reassembler.pending(), 2);
    }

    #[test]
    fn test_json_and_msgpack_decode_documents() {
        let start = doc(StartDoc::with_uid("A", "count").with_metadata("scan_id", 3));
        for encoding in [Encoding::Json, Encoding::Msgpack] {
            let bytes = encoding.encode(&start).unwrap();
            assert_eq!(encoding.decoder().decode(&bytes).unwrap(), start);
        }
        assert!(matches!(
            MsgpackDecoder.decode(b"\xc1garbage"),
            Err(RunVizError::Decode(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(DispatcherConfig::default().validate().is_ok());
        let config = DispatcherConfig {
            recv_timeout_ms: 0,
            ..DispatcherConfig::default()
        };
        assert!(RemoteDispatcher::new(config, &Diagnostics::new()).is_err());
    }

    #[tokio::test]
    async fn test_documents_reach_the_bus_in_order() {
        let (tx, source) = ChannelSource::new();
        let diagnostics = Diagnostics::new();
        let mut dispatcher =
            RemoteDispatcher::with_source(DispatcherConfig::default(), Box::new(source), &diagnostics)
                .unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
        dispatcher.start().unwrap();

        let event = EventDoc::new("A", "primary", 1).with_datum("det", 1.0);
        let (header, values) = event.clone().split();
        tx.send(message(Encoding::Msgpack, &[doc(StartDoc::with_uid("A", "count"))]))
            .unwrap();
        tx.send(message(Encoding::Msgpack, &[WireFrame::Fragment(Fragment::EventValues(values))]))
            .unwrap();
        tx.send(message(
            Encoding::Msgpack,
            &[
                WireFrame::Fragment(Fragment::EventHeader(header)),
                doc(StopDoc::success("A")),
            ],
        ))
        .unwrap();
        drop(tx);

        let bus = DocumentBus::new(diagnostics);
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_all(move |d| {
            s.lock().push(d.kind());
            Ok(())
        });

        let published = dispatcher.forward(&bus).await;
        assert_eq!(published, 3);
        assert_eq!(
            *seen.lock(),
            vec![
                crate::document::DocumentKind::Start,
                crate::document::DocumentKind::Event,
                crate::document::DocumentKind::Stop
            ]
        );
        // The closed channel is a broken transport.
        assert!(matches!(wait_terminal(&dispatcher).await, DispatcherState::Failed(_)));
    }

    #[tokio::test]
    async fn test_bad_frame_is_dropped_and_loop_continues() {
        let (tx, source) = ChannelSource::new();
        let diagnostics = Diagnostics::new();
        let mut rx = diagnostics.subscribe();
        let mut dispatcher =
            RemoteDispatcher::with_source(DispatcherConfig::default(), Box::new(source), &diagnostics)
                .unwrap();
        dispatcher.start().unwrap();

        tx.send(vec![Bytes::from_static(b"docs"), Bytes::from_static(b"\xc1not msgpack")])
            .unwrap();
        tx.send(message(Encoding::Msgpack, &[doc(StartDoc::with_uid("B", "count"))]))
            .unwrap();

        let next = dispatcher.next_document().await.unwrap();
        assert_eq!(next.run_uid(), "B");
        let diag = rx.recv().await.unwrap();
        assert!(matches!(*diag.error, RunVizError::Decode(_)));

        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_interrupts_an_idle_running_loop() {
        let (tx, source) = ChannelSource::new();
        let config = DispatcherConfig {
            recv_timeout_ms: 5,
            ..DispatcherConfig::default()
        };
        let mut dispatcher = RemoteDispatcher::with_source(config, Box::new(source), &Diagnostics::new()).unwrap();
        dispatcher.start().unwrap();

        let mut state = dispatcher.watch_state();
        state.wait_for(|s| *s == DispatcherState::Running).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(message(Encoding::Msgpack, &[doc(StartDoc::with_uid("C", "count"))]))
            .unwrap();
        assert_eq!(dispatcher.next_document().await.unwrap().run_uid(), "C");

        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        drop(tx);
    }

    #[tokio::test]
    async fn test_stop_before_connect_completes() {
        struct NeverConnects;

        #[async_trait]
        impl FrameSource for NeverConnects {
            async fn connect(&mut self) -> AppResult<()> {
                std::future::pending().await
            }
            async fn recv(&mut self) -> AppResult<Vec<Bytes>> {
                std::future::pending().await
            }
        }

        let mut dispatcher = RemoteDispatcher::with_source(
            DispatcherConfig::default(),
            Box::new(NeverConnects),
            &Diagnostics::new(),
        )
        .unwrap();
        tokio_test::assert_ok!(dispatcher.start());
        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        tokio_test::assert_err!(dispatcher.start());
    }

    #[test]
    fn test_stop_without_start() {
        let (_tx, source) = ChannelSource::new();
        let mut dispatcher =
            RemoteDispatcher::with_source(DispatcherConfig::default(), Box::new(source), &Diagnostics::new())
                .unwrap();
        dispatcher.stop();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(dispatcher.pump(&DocumentBus::default()), 0);
    }
}
