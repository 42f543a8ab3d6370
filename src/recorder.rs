//! The recorder ties a device connection, the streaming loop, the recording
//! session and the dataset store together.
//!
//! All public operations report their outcome twice: as a `Result` for the
//! caller and as a [`Notice`] through the notification callback.

use crate::connector::{
    BitSelection, ConnectionConfig, ConnectionError, OpenedPort, PortDescription, PortOpener,
    SerialOpener,
};
use crate::dataset_store::{CommittedDataset, DatasetId, DatasetStore, StoreConfig, StoreError};
use crate::export::{DownloadSink, ExportError, ExportPipeline, ExportReport};
use crate::line_framer::LineFramer;
use crate::notice::{Notice, NoticeLevel};
use crate::recording::{
    format_duration, parse_custom_minutes, RecordingSession, RecordingStateError, RecordingStatus,
    SessionTimer, Tick, TickControl,
};
use crate::sample_router::{ChannelSchema, RouterOutcome, SampleRouter, SampleRow, StreamStats};
use crate::transport::{ReadError, ReadOutcome, Transport, TransportReader, WriteError};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recording(#[from] RecordingStateError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub store: StoreConfig,
    /// How often the elapsed recording time advances by one second.
    pub tick_period: Duration,
    /// Recorded rows are written to the persistent buffer in batches of this
    /// size, and once more when the recording stops.
    pub buffer_flush_rows: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            tick_period: Duration::from_secs(1),
            buffer_flush_rows: 256,
        }
    }
}

/// Result of a completed recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_seconds: u64,
    pub dataset_id: DatasetId,
    pub rows: usize,
    /// Datasets waiting for export, including this one.
    pub stored_datasets: usize,
}

impl RecordingSummary {
    pub fn notice(&self) -> Notice {
        Notice::success("Recording completed Successfully")
            .with_detail(format!(
                "Start Time: {}",
                self.started_at.format("%H:%M:%S")
            ))
            .with_detail(format!("End Time: {}", self.ended_at.format("%H:%M:%S")))
            .with_detail(format!(
                "Recording Duration: {}",
                format_duration(self.duration_seconds)
            ))
            .with_detail(format!("Stored Recorded Files: {}", self.stored_datasets))
    }
}

/// Point-in-time view of the recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: RecordingStatus,
    pub started_at: Option<DateTime<Local>>,
    pub elapsed_seconds: u64,
    pub deadline_seconds: Option<u64>,
    /// Whether the elapsed-time task is running.
    pub ticking: bool,
    /// Rows captured so far, persisted or not.
    pub rows: usize,
}

type SampleCallback = Arc<dyn Fn(&SampleRow) + Send + Sync>;
type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
type NoticeCallback = Arc<dyn Fn(&Notice) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    on_sample: Option<SampleCallback>,
    on_connection: Option<ConnectionCallback>,
    on_notice: Option<NoticeCallback>,
    on_device_message: Option<MessageCallback>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Scaling {
    selected: BitSelection,
    detected: Option<BitSelection>,
}

struct Link {
    id: u64,
    transport: Transport,
    info: PortDescription,
}

#[derive(Default)]
struct SessionSlot {
    session: RecordingSession,
    /// Recorded rows not yet written to the store's buffer.
    staged: Vec<SampleRow>,
    /// Rows already written to the store's buffer this session.
    persisted: usize,
    timer: Option<SessionTimer>,
    generation: u64,
}

impl SessionSlot {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct Shared {
    config: RecorderConfig,
    store: DatasetStore,
    opener: Arc<dyn PortOpener>,
    callbacks: Callbacks,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    session: Mutex<SessionSlot>,
    router: parking_lot::Mutex<SampleRouter>,
    scaling: parking_lot::Mutex<Scaling>,
}

pub struct RecorderBuilder {
    config: RecorderConfig,
    opener: Option<Arc<dyn PortOpener>>,
    callbacks: Callbacks,
}

impl RecorderBuilder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            opener: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the serial port opener, e.g. with an in-memory device.
    pub fn opener(mut self, opener: impl PortOpener + 'static) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    /// Live view: called once per sample row, recording or not.
    pub fn on_sample(mut self, f: impl Fn(&SampleRow) + Send + Sync + 'static) -> Self {
        self.callbacks.on_sample = Some(Arc::new(f));
        self
    }

    pub fn on_connection(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.callbacks.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_notice(mut self, f: impl Fn(&Notice) + Send + Sync + 'static) -> Self {
        self.callbacks.on_notice = Some(Arc::new(f));
        self
    }

    /// Single-field lines sent by the device.
    pub fn on_device_message(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_device_message = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Recorder {
        let store = DatasetStore::new(self.config.store.clone());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Recorder {
            inner: Arc::new(Shared {
                config: self.config,
                store,
                opener: self.opener.unwrap_or_else(|| Arc::new(SerialOpener)),
                callbacks: self.callbacks,
                state,
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(0),
                session: Mutex::new(SessionSlot::default()),
                router: parking_lot::Mutex::new(SampleRouter::new()),
                scaling: parking_lot::Mutex::new(Scaling::default()),
            }),
        }
    }
}

/// Handle to a recorder. Clones share the same device and session.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Shared>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> Self {
        RecorderBuilder::new(config).build()
    }

    pub fn builder(config: RecorderConfig) -> RecorderBuilder {
        RecorderBuilder::new(config)
    }

    /// Open the dataset store. Must succeed once before recording or export.
    pub async fn init_store(&self) -> Result<(), RecorderError> {
        let result = self.inner.store.init().await;
        self.inner.reported(result)
    }

    pub fn is_store_ready(&self) -> bool {
        self.inner.store.is_ready()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Port of the live connection.
    pub async fn connected_port(&self) -> Option<PortDescription> {
        let link = self.inner.link.lock().await;
        link.as_ref().map(|l| l.info.clone())
    }

    #[tracing::instrument(skip(self))]
    pub async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<PortDescription, RecorderError> {
        let shared = &self.inner;
        let mut link = shared.link.lock().await;
        let claimed = link.is_none()
            && shared.state.send_if_modified(|state| {
                if *state == ConnectionState::Disconnected {
                    *state = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
        if !claimed {
            return shared.reported(Err(ConnectionError::AlreadyConnected));
        }

        let OpenedPort { io, info } = match shared.opener.open(config).await {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("Error connecting to device: {}", e);
                shared.state.send_replace(ConnectionState::Disconnected);
                let notice = Notice::error("Error connecting to device");
                shared.notify(notice.with_detail(e.to_string()));
                return Err(e.into());
            }
        };

        shared.apply_detected_bits(info.detected_bits());
        *shared.router.lock() = SampleRouter::new();

        let id = shared.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (mut transport, reader) = Transport::split(io, config.chunk_size);
        shared.state.send_replace(ConnectionState::Connected);
        transport.attach_reader_task(tokio::spawn(read_loop(Arc::downgrade(shared), reader, id)));
        *link = Some(Link {
            id,
            transport,
            info: info.clone(),
        });

        log::info!("Connected to {} ({})", info.port_name, info.describe());
        shared.callbacks.connection(true);
        shared.notify(
            Notice::success("Connection Successful")
                .with_detail(format!("Device: {}", info.describe()))
                .with_detail(format!("Baud Rate: {}", config.baud_rate)),
        );
        drop(link);
        Ok(info)
    }

    /// Close the connection. Does nothing when none is open.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.close_link(None).await;
    }

    /// Send a newline-terminated text command to the device.
    pub async fn write_command(&self, command: &str) -> Result<(), RecorderError> {
        let mut link = self.inner.link.lock().await;
        let result = match link.as_mut() {
            Some(link) if self.is_connected() => link.transport.write_line(command).await,
            _ => Err(WriteError::NotConnected),
        };
        drop(link);
        if result.is_ok() {
            log::debug!("Sent command {:?}", command);
        }
        self.inner.reported(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_recording(&self) -> Result<(), RecorderError> {
        let shared = &self.inner;
        if !shared.store.is_ready() {
            shared.notify(Notice::error(
                "Data storage is not ready. Please try again in a moment.",
            ));
            return Err(StoreError::NotReady.into());
        }
        if !self.is_connected() {
            shared.notify(Notice::warning("No device is connected"));
            return Err(RecordingStateError::NotConnected.into());
        }

        let mut slot = shared.session.lock().await;
        if slot.session.is_recording() {
            return shared.reported(Err(RecordingStateError::AlreadyRecording));
        }
        if let Err(e) = shared.store.clear_buffer().await {
            log::error!("Could not clear the recording buffer: {}", e);
            shared.notify(Notice::error("Failed to start recording. Please try again."));
            return Err(e.into());
        }

        slot.staged.clear();
        slot.persisted = 0;
        slot.session.start(Local::now())?;
        slot.generation += 1;
        slot.timer = Some(shared.spawn_timer(slot.generation));

        match slot.session.deadline_seconds() {
            Some(deadline) => log::info!(
                "Recording started, stopping after {}",
                format_duration(deadline)
            ),
            None => log::info!("Recording started"),
        }
        Ok(())
    }

    /// Stop the recording and store what was captured as a new dataset.
    #[tracing::instrument(skip(self))]
    pub async fn stop_recording(&self) -> Result<RecordingSummary, RecorderError> {
        let mut slot = self.inner.session.lock().await;
        self.inner.finish_recording(&mut slot).await
    }

    /// Set the auto-stop deadline in minutes, or clear it with `None`.
    /// Returns the deadline in seconds.
    pub async fn set_deadline(&self, minutes: Option<u32>) -> Result<Option<u64>, RecorderError> {
        let mut slot = self.inner.session.lock().await;
        let result = slot.session.set_deadline(minutes);
        drop(slot);
        let deadline = self.inner.reported(result)?;
        match minutes {
            Some(m) => {
                log::debug!("Recording deadline set to {} minute(s)", m);
                let message = format!("Recording end time set to {m} minutes");
                self.inner.notify(Notice::info(message));
            }
            None => self
                .inner
                .notify(Notice::info("Recording set to no time limit")),
        }
        Ok(deadline)
    }

    /// Set the deadline from user-typed minutes.
    pub async fn set_custom_deadline(&self, input: &str) -> Result<Option<u64>, RecorderError> {
        let minutes = self.inner.reported(parse_custom_minutes(input))?;
        self.set_deadline(Some(minutes)).await
    }

    pub async fn session_snapshot(&self) -> SessionSnapshot {
        let slot = self.inner.session.lock().await;
        SessionSnapshot {
            status: slot.session.status(),
            started_at: slot.session.started_at(),
            elapsed_seconds: slot.session.elapsed_seconds(),
            deadline_seconds: slot.session.deadline_seconds(),
            ticking: slot.timer.as_ref().is_some_and(|t| !t.is_cancelled()),
            rows: slot.persisted + slot.staged.len(),
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.session.lock().await.session.is_recording()
    }

    /// Hand every stored dataset to `sink` and drop them from the store.
    #[tracing::instrument(skip_all)]
    pub async fn export_all(&self, sink: &dyn DownloadSink) -> Result<ExportReport, RecorderError> {
        let pipeline = ExportPipeline::new(&self.inner.store);
        let result = pipeline.export_all(sink).await;
        let report = match result {
            Err(ExportError::NoData) => {
                self.inner
                    .notify(Notice::error("No data available to download."));
                return Err(ExportError::NoData.into());
            }
            other => self.inner.reported(other)?,
        };
        self.inner.notify(
            Notice::success("Data saved successfully.")
                .with_detail(format!(
                    "{} ({} recording(s))",
                    report.file_name, report.datasets
                )),
        );
        Ok(report)
    }

    /// Datasets waiting for export.
    pub async fn recordings_count(&self) -> Result<usize, RecorderError> {
        let result = self.inner.store.count().await;
        self.inner.reported(result)
    }

    pub fn bit_selection(&self) -> BitSelection {
        self.inner.scaling.lock().selected
    }

    pub fn set_bit_selection(&self, bits: BitSelection) {
        self.inner.scaling.lock().selected = bits;
    }

    /// Bit width of the connected board, when it was recognised.
    pub fn detected_bits(&self) -> Option<BitSelection> {
        self.inner.scaling.lock().detected
    }

    /// Flip between automatic scaling and the detected board's bit width.
    /// Without a detected board the selection is left alone.
    pub fn toggle_autoscale(&self) -> BitSelection {
        let mut scaling = self.inner.scaling.lock();
        if let Some(detected) = scaling.detected {
            scaling.selected = if scaling.selected == BitSelection::Auto {
                detected
            } else {
                BitSelection::Auto
            };
        }
        scaling.selected
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.inner.router.lock().stats()
    }

    pub fn channel_schema(&self) -> ChannelSchema {
        self.inner.router.lock().schema()
    }
}

impl Callbacks {
    fn sample(&self, row: &SampleRow) {
        if let Some(f) = &self.on_sample {
            f(row);
        }
    }

    fn connection(&self, connected: bool) {
        if let Some(f) = &self.on_connection {
            f(connected);
        }
    }

    fn device_message(&self, message: &str) {
        if let Some(f) = &self.on_device_message {
            f(message);
        }
    }

    fn notice(&self, notice: &Notice) {
        if let Some(f) = &self.on_notice {
            f(notice);
        }
    }
}

impl Shared {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => log::error!("{}", notice.message),
            NoticeLevel::Warning => log::warn!("{}", notice.message),
            NoticeLevel::Success | NoticeLevel::Info => log::info!("{}", notice.message),
        }
        self.callbacks.notice(&notice);
    }

    /// Pass `result` through, emitting an error notice when it failed.
    fn reported<T, E: Into<RecorderError>>(
        &self,
        result: Result<T, E>,
    ) -> Result<T, RecorderError> {
        result.map_err(|e| {
            let e = e.into();
            self.notify(Notice::error(e.to_string()));
            e
        })
    }

    fn apply_detected_bits(&self, detected: Option<BitSelection>) {
        let mut scaling = self.scaling.lock();
        scaling.detected = detected;
        if let Some(bits) = detected {
            scaling.selected = bits;
        }
    }

    /// Tear down the connection `only` names, or whichever is open.
    async fn close_link(&self, only: Option<u64>) {
        let link = {
            let mut guard = self.link.lock().await;
            let wanted = guard
                .as_ref()
                .is_some_and(|link| only.is_none_or(|id| link.id == id));
            if wanted { guard.take() } else { None }
        };
        let Some(mut link) = link else {
            log::debug!("No connection to close");
            return;
        };

        self.state.send_replace(ConnectionState::Disconnecting);
        link.transport.close().await;
        self.force_idle().await;

        log::info!("Disconnected from {}", link.info.port_name);
        self.callbacks.connection(false);
        self.notify(Notice::info("Disconnected from device"));
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Leave the recording state because the device went away, saving what
    /// was captured when possible.
    async fn force_idle(&self) {
        let mut slot = self.session.lock().await;
        slot.stop_timer();
        if !slot.session.is_recording() {
            return;
        }

        if let Err(e) = slot.session.finish(Local::now()) {
            log::warn!("Recording ended without a valid start time: {}", e);
        }
        match self.persist(&mut slot).await {
            Ok(committed) => {
                log::warn!(
                    "Recording interrupted by disconnection, saved {} row(s) as dataset {:?}",
                    committed.rows,
                    committed.id
                );
                self.notify(
                    Notice::warning("Recording stopped because the device disconnected")
                        .with_detail(format!("Saved Samples: {}", committed.rows)),
                );
            }
            Err(e) => {
                log::warn!("Could not save the interrupted recording: {}", e);
                slot.staged.clear();
                slot.persisted = 0;
            }
        }
    }

    async fn finish_recording(
        &self,
        slot: &mut SessionSlot,
    ) -> Result<RecordingSummary, RecorderError> {
        slot.stop_timer();
        let timing = match slot.session.finish(Local::now()) {
            Ok(timing) => timing,
            Err(e) => {
                slot.staged.clear();
                slot.persisted = 0;
                return self.reported(Err(e));
            }
        };

        let committed = match self.persist(slot).await {
            Ok(committed) => committed,
            Err(e) => {
                let unsaved = slot.persisted + slot.staged.len();
                log::debug!("Discarding {} unsaved row(s)", unsaved);
                slot.staged.clear();
                slot.persisted = 0;
                return self.reported(Err(e));
            }
        };
        let result = self.store.count().await;
        let stored_datasets = self.reported(result)?;

        let summary = RecordingSummary {
            started_at: timing.started_at,
            ended_at: timing.ended_at,
            duration_seconds: timing.duration_seconds,
            dataset_id: committed.id,
            rows: committed.rows,
            stored_datasets,
        };
        log::info!(
            "Recording stopped after {}: {} row(s) stored as dataset {:?}",
            format_duration(summary.duration_seconds),
            summary.rows,
            summary.dataset_id
        );
        self.notify(summary.notice());
        Ok(summary)
    }

    async fn flush_staged(&self, slot: &mut SessionSlot) -> Result<(), StoreError> {
        if slot.staged.is_empty() {
            return Ok(());
        }
        self.store.append_to_buffer(&slot.staged).await?;
        slot.persisted += slot.staged.len();
        slot.staged.clear();
        Ok(())
    }

    /// Flush staged rows and move the whole buffer into a new dataset.
    async fn persist(&self, slot: &mut SessionSlot) -> Result<CommittedDataset, StoreError> {
        self.flush_staged(slot).await?;
        let committed = self.store.commit_buffer().await?;
        slot.persisted = 0;
        Ok(committed)
    }

    fn spawn_timer(self: &Arc<Self>, generation: u64) -> SessionTimer {
        let weak = Arc::downgrade(self);
        SessionTimer::spawn(self.config.tick_period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => shared.on_tick(generation).await,
                    None => TickControl::Stop,
                }
            }
        })
    }

    async fn on_tick(&self, generation: u64) -> TickControl {
        let mut slot = self.session.lock().await;
        if slot.generation != generation {
            return TickControl::Stop;
        }
        match slot.session.tick() {
            Tick::Idle => TickControl::Stop,
            Tick::Running { .. } => TickControl::Continue,
            Tick::DeadlineReached { elapsed_seconds } => {
                log::info!(
                    "Recording deadline of {} reached",
                    format_duration(elapsed_seconds)
                );
                // failures were already reported as notices
                let _ = self.finish_recording(&mut slot).await;
                TickControl::Stop
            }
        }
    }

    /// Route one chunk's worth of lines.
    async fn ingest(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let mut slot = self.session.lock().await;
        let recording = slot.session.is_recording();

        let mut live = Vec::with_capacity(lines.len());
        let mut messages = Vec::new();
        {
            let mut router = self.router.lock();
            for line in &lines {
                match router.route(line, recording, |row| live.push(row.clone())) {
                    RouterOutcome::Control(message) => messages.push(message),
                    RouterOutcome::Live => {}
                    RouterOutcome::Record(row) => slot.staged.push(row),
                }
            }
        }

        for row in &live {
            self.callbacks.sample(row);
        }
        for message in &messages {
            log::debug!("Device message: {}", message);
            self.callbacks.device_message(message);
        }

        if slot.staged.len() >= self.config.buffer_flush_rows.max(1) {
            if let Err(e) = self.flush_staged(&mut slot).await {
                log::warn!("Could not persist recorded rows, keeping them: {}", e);
            }
        }
    }
}

/// Reads the device until it closes, fails, or the connection is closed.
async fn read_loop(shared: Weak<Shared>, mut reader: TransportReader, link_id: u64) {
    let mut framer = LineFramer::new();
    let ended = loop {
        let outcome = reader.read().await;
        if reader.is_cancelled() {
            break None;
        }
        let Some(recorder) = shared.upgrade() else {
            break None;
        };
        match outcome {
            Ok(ReadOutcome::Chunk(bytes)) => recorder.ingest(framer.feed(&bytes)).await,
            Ok(ReadOutcome::End) => {
                let rest = framer.finish();
                if !rest.is_empty() {
                    recorder.ingest(vec![rest]).await;
                }
                log::info!("Device closed the connection");
                break Some(Notice::warning("Device closed the connection"));
            }
            Ok(ReadOutcome::Cancelled) => break None,
            Err(e) => {
                log::error!("Error reading from device: {}", e);
                let notice = Notice::error("Error reading from device");
                break Some(notice.with_detail(e.to_string()));
            }
        }
    };
    log::debug!("Read loop exited");

    let (Some(notice), Some(shared)) = (ended, shared.upgrade()) else {
        return;
    };
    shared.notify(notice);

    let claimed = shared.state.send_if_modified(|state| {
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Disconnecting;
            true
        } else {
            false
        }
    });
    if claimed {
        tokio::spawn(async move { shared.close_link(Some(link_id)).await });
    }
}
