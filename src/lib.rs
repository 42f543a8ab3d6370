//! # BioAmp Recorder
//!
//! A Rust library for streaming, recording and exporting multi-channel samples
//! from serial-attached biosignal acquisition boards.
//!
//! Boards send ASCII lines such as `12,512,498,503,0,0,0\n`: a wrapping
//! 0-255 counter followed by one value per channel. Lines with a single field
//! are device log or control messages.
//!
//! ## Features
//!
//! - **Device discovery**: USB serial ports via `serialport`, with board and
//!   vendor recognition from USB product/vendor IDs
//! - **Streaming**: async reading with `tokio-serial`, incremental UTF-8 line
//!   framing and a live-view callback per sample
//! - **Recording sessions**: start/stop, elapsed time, optional auto-stop
//!   deadline
//! - **Dataset storage**: in-memory or SQLite (`rusqlite`) buffer and datasets
//! - **Export**: one recording as `data.csv`, several as `datasets.zip`, and a
//!   `polars` DataFrame view of each dataset
//!
//! ## Examples
//!
//! ### Recording from the first board found
//!
//! ```rust,no_run
//! use bioamp_recorder::{ConnectionConfig, DirectorySink, Recorder, RecorderConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = Recorder::builder(RecorderConfig::default())
//!     .on_sample(|row| println!("{}", row.to_line()))
//!     .on_notice(|notice| println!("{notice}"))
//!     .build();
//!
//! recorder.init_store().await?;
//! recorder.connect(&ConnectionConfig::new()).await?;
//!
//! recorder.set_deadline(Some(1)).await?; // stop by itself after one minute
//! recorder.start_recording().await?;
//! tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//! let summary = recorder.stop_recording().await?;
//! println!("Recorded {} rows", summary.rows);
//!
//! recorder.export_all(&DirectorySink::new("recordings")).await?;
//! recorder.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Framing and routing lines
//!
//! ```rust
//! use bioamp_recorder::{LineFramer, RouterOutcome, SampleRouter};
//!
//! let mut framer = LineFramer::new();
//! let mut router = SampleRouter::new();
//!
//! let lines = framer.feed(b"BioAmp ready\n1,10,20\n2,1");
//! assert_eq!(lines, ["BioAmp ready", "1,10,20"]);
//! assert_eq!(framer.pending(), "2,1");
//!
//! let outcomes: Vec<_> = lines
//!     .iter()
//!     .map(|line| router.route(line, false, |_| {}))
//!     .collect();
//! assert_eq!(outcomes[0], RouterOutcome::Control("BioAmp ready".to_string()));
//! assert_eq!(outcomes[1], RouterOutcome::Live);
//! ```
//!
//! ### Device discovery
//!
//! ```rust,no_run
//! use bioamp_recorder::DeviceConnector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! for port in DeviceConnector::available_ports()? {
//!     println!("{}: {}", port.port_name, port.describe());
//! }
//! # Ok(())
//! # }
//! ```

pub mod connector;
pub mod dataset_store;
pub mod export;
pub mod line_framer;
pub mod notice;
pub mod recorder;
pub mod recording;
pub mod sample_router;
pub mod transport;

// Re-export the main types for convenience
pub use connector::{
    identify_port, BitSelection, ConnectionConfig, ConnectionError, DeviceConnector, OpenedPort,
    PortDescription, PortIdentity, PortOpener, SerialOpener,
};

pub use dataset_store::{
    Dataset, DatasetId, DatasetStore, MemoryRecordStore, RecordStore, SqliteRecordStore,
    StoreConfig, StoreError,
};

pub use export::{
    dataset_to_csv, DirectorySink, DownloadSink, ExportArtifact, ExportError, ExportPipeline,
    ExportReport,
};

pub use line_framer::LineFramer;

pub use notice::{Notice, NoticeLevel};

pub use recorder::{
    ConnectionState, Recorder, RecorderBuilder, RecorderConfig, RecorderError, RecordingSummary,
    SessionSnapshot,
};

pub use recording::{
    format_clock, format_duration, parse_custom_minutes, RecordingSession, RecordingStateError,
    RecordingStatus, PRESET_DEADLINE_MINUTES,
};

pub use sample_router::{
    ChannelSchema, CounterTracker, RouterOutcome, SampleRouter, SampleRow, StreamStats,
};

pub use transport::{ReadError, ReadOutcome, SerialIo, Transport, TransportReader, WriteError};
