// Recording example
//
// Connects to a board, records until the deadline or Ctrl+C, then exports
// every stored recording into a directory.

use bioamp_recorder::{
    format_clock, ConnectionConfig, DirectorySink, Recorder, RecorderConfig, RecordingStatus,
    StoreConfig,
};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "record")]
#[command(version = "1.0")]
#[command(about = "Record samples from a serial acquisition board")]
#[command(long_about = "Stream samples from a serial-attached board, record them for a fixed time or until Ctrl+C, and write the recordings as CSV (one recording) or a zip archive (several).")]
struct Args {
    /// Serial port, e.g. /dev/ttyACM0. Auto-detected when omitted
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 115_200, help = "Baud rate")]
    baud: u32,

    #[arg(short, long, help = "Stop recording after this many minutes")]
    minutes: Option<u32>,

    #[arg(short, long, default_value = ".", help = "Directory the export is written to")]
    out_dir: PathBuf,

    #[arg(long, help = "Keep recordings in this SQLite file instead of memory")]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let store = match &args.db {
        Some(path) => StoreConfig::Sqlite { path: path.clone() },
        None => StoreConfig::InMemory,
    };
    let samples = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&samples);

    let recorder = Recorder::builder(RecorderConfig {
        store,
        ..RecorderConfig::default()
    })
    .on_sample(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    })
    .on_notice(|notice| println!("{notice}"))
    .on_device_message(|message| println!("device: {message}"))
    .build();

    recorder.init_store().await?;

    let mut config = ConnectionConfig::new().baud_rate(args.baud);
    if let Some(port) = &args.port {
        config = config.port(port.clone());
    }
    recorder.connect(&config).await?;

    if args.minutes.is_some() {
        recorder.set_deadline(args.minutes).await?;
    }
    recorder.start_recording().await?;
    println!("Recording... press Ctrl+C to stop\n");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                if recorder.is_recording().await {
                    recorder.stop_recording().await?;
                }
                break;
            }
            _ = ticker.tick() => {
                let snapshot = recorder.session_snapshot().await;
                if snapshot.status != RecordingStatus::Recording {
                    break;
                }
                let deadline = snapshot
                    .deadline_seconds
                    .map_or_else(|| "--:--".to_string(), format_clock);
                print!(
                    "\r{} / {}  samples: {}  rows: {}",
                    format_clock(snapshot.elapsed_seconds),
                    deadline,
                    samples.load(Ordering::Relaxed),
                    snapshot.rows
                );
                std::io::stdout().flush()?;
            }
        }
    }

    let stats = recorder.stream_stats();
    println!(
        "\nLines: {}  samples: {}  control: {}  counter gaps: {} ({} missed)",
        stats.lines, stats.samples, stats.control_lines, stats.counter_gaps, stats.missed_samples
    );

    recorder.disconnect().await;
    let sink = DirectorySink::new(args.out_dir.clone());
    let report = recorder.export_all(&sink).await?;
    println!(
        "Wrote {} with {} recording(s)",
        args.out_dir.join(report.file_name).display(),
        report.datasets
    );
    Ok(())
}
