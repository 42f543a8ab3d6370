use crate::dataset_store::{Dataset, DatasetStore, StoreError};
use crate::sample_router::SampleRow;
use async_trait::async_trait;
use polars::prelude::{Column, DataFrame, NamedFrom, PolarsError, Series};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Header row of every exported file.
pub const COLUMN_NAMES: [&str; 7] = [
    "Counter",
    "Channel 1",
    "Channel 2",
    "Channel 3",
    "Channel 4",
    "Channel 5",
    "Channel 6",
];

pub const SINGLE_FILE_NAME: &str = "data.csv";
pub const ARCHIVE_FILE_NAME: &str = "datasets.zip";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("No data available to download")]
    NoData,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coerce a text field to a number following JavaScript `Number()` rules:
/// surrounding whitespace is ignored, an empty field is `0`, `0x`/`0o`/`0b`
/// prefixes select the radix and anything unparseable is `NaN`.
pub fn coerce_field(field: &str) -> f64 {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let radix = match trimmed.get(..2) {
        Some("0x" | "0X") => 16,
        Some("0o" | "0O") => 8,
        Some("0b" | "0B") => 2,
        _ => 10,
    };
    if radix != 10 {
        let digits = &trimmed[2..];
        if digits.is_empty() {
            return f64::NAN;
        }
        let value = digits.chars().try_fold(0.0_f64, |acc, c| {
            let digit = c.to_digit(radix)?;
            Some(acc.mul_add(f64::from(radix), f64::from(digit)))
        });
        return value.unwrap_or(f64::NAN);
    }

    let unsigned = trimmed
        .strip_prefix(|c: char| c == '+' || c == '-')
        .unwrap_or(trimmed);
    if unsigned == "Infinity" {
        return if trimmed.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }
    // Rust accepts "inf" and "nan" spellings that Number() does not
    if unsigned
        .bytes()
        .any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E')
    {
        return f64::NAN;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}

/// Print a number the way JavaScript's `String(number)` does.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let magnitude = value.abs();
    if (1e-6..1e21).contains(&magnitude) {
        return format!("{value}");
    }

    let exponential = format!("{value:e}");
    match exponential.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => exponential,
    }
}

/// Serialize rows as CSV: the fixed header, then one line per sample.
/// Lines are joined with `\n` and there is no trailing newline.
pub fn dataset_to_csv(rows: &[SampleRow]) -> String {
    let mut csv = COLUMN_NAMES.join(",");
    for row in rows {
        csv.push('\n');
        let values: Vec<String> = row.numeric_fields().map(format_number).collect();
        csv.push_str(&values.join(","));
    }
    csv
}

fn column_name(index: usize) -> String {
    COLUMN_NAMES
        .get(index)
        .map_or_else(|| format!("Channel {index}"), |name| (*name).to_string())
}

/// Rows as a `DataFrame` of float columns. Short rows are padded with nulls.
pub fn rows_to_dataframe(rows: &[SampleRow]) -> Result<DataFrame, PolarsError> {
    let width = rows
        .iter()
        .map(SampleRow::len)
        .max()
        .unwrap_or(0)
        .max(COLUMN_NAMES.len());

    let mut values: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(rows.len()); width];
    for row in rows {
        let mut fields = row.numeric_fields();
        for column in &mut values {
            column.push(fields.next());
        }
    }

    let columns: Vec<Column> = values
        .into_iter()
        .enumerate()
        .map(|(i, column)| Series::new(column_name(i).into(), column).into())
        .collect();

    DataFrame::new(columns)
}

/// A file ready to hand to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportArtifact {
    Csv { contents: String },
    Archive { bytes: Vec<u8>, files: Vec<String> },
}

impl ExportArtifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Csv { .. } => SINGLE_FILE_NAME,
            Self::Archive { .. } => ARCHIVE_FILE_NAME,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Csv { .. } => "text/csv;charset=utf-8",
            Self::Archive { .. } => "application/zip",
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Csv { contents } => contents.as_bytes(),
            Self::Archive { bytes, .. } => bytes,
        }
    }
}

/// Package finalized datasets: one becomes a CSV file, several become a zip of
/// `data1.csv`, `data2.csv`, ... in commit order.
pub fn package(datasets: &[Dataset]) -> Result<ExportArtifact, ExportError> {
    match datasets {
        [] => Err(ExportError::NoData),
        [single] => Ok(ExportArtifact::Csv {
            contents: dataset_to_csv(single.rows()),
        }),
        many => {
            let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

            let mut files = Vec::with_capacity(many.len());
            for (index, dataset) in many.iter().enumerate() {
                let name = format!("data{}.csv", index + 1);
                zip.start_file(name.as_str(), options)?;
                zip.write_all(dataset_to_csv(dataset.rows()).as_bytes())?;
                files.push(name);
            }

            let bytes = zip.finish()?.into_inner();
            Ok(ExportArtifact::Archive { bytes, files })
        }
    }
}

/// Where a finished export is delivered.
#[async_trait]
pub trait DownloadSink: Send + Sync {
    async fn deliver(&self, artifact: &ExportArtifact) -> Result<(), ExportError>;
}

/// Writes the artifact into a directory under its own file name.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, artifact: &ExportArtifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }
}

#[async_trait]
impl DownloadSink for DirectorySink {
    async fn deliver(&self, artifact: &ExportArtifact) -> Result<(), ExportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(artifact);
        tokio::fs::write(&path, artifact.bytes()).await?;
        log::info!(
            "Wrote {} ({} bytes)",
            path.display(),
            artifact.bytes().len()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub file_name: &'static str,
    pub datasets: usize,
}

/// Drains finalized datasets from the store into a download.
pub struct ExportPipeline<'a> {
    store: &'a DatasetStore,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(store: &'a DatasetStore) -> Self {
        Self { store }
    }

    /// Export every stored dataset. The store is left untouched when there is
    /// nothing to export or delivery fails; otherwise the exported datasets
    /// are removed, so each recording is downloaded at most once.
    pub async fn export_all(&self, sink: &dyn DownloadSink) -> Result<ExportReport, ExportError> {
        if self.store.count().await? == 0 {
            log::info!("Nothing to export");
            return Err(ExportError::NoData);
        }

        let datasets = self.store.list_datasets().await?;
        let artifact = package(&datasets)?;
        sink.deliver(&artifact).await?;

        let ids: Vec<_> = datasets.iter().map(Dataset::id).collect();
        self.store.remove_datasets(&ids).await?;

        log::info!(
            "Exported {} dataset(s) as {}",
            datasets.len(),
            artifact.file_name()
        );
        Ok(ExportReport {
            file_name: artifact.file_name(),
            datasets: datasets.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset_store::StoreConfig;
    use parking_lot::Mutex;
    use std::io::Read;

    fn rows(lines: &[&str]) -> Vec<SampleRow> {
        lines.iter().filter_map(|l| SampleRow::parse(l)).collect()
    }

    #[derive(Default)]
    struct CollectingSink {
        delivered: Mutex<Vec<ExportArtifact>>,
    }

    #[async_trait]
    impl DownloadSink for CollectingSink {
        async fn deliver(&self, artifact: &ExportArtifact) -> Result<(), ExportError> {
            self.delivered.lock().push(artifact.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DownloadSink for FailingSink {
        async fn deliver(&self, _artifact: &ExportArtifact) -> Result<(), ExportError> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    async fn store_with(datasets: &[&[&str]]) -> DatasetStore {
        let store = DatasetStore::new(StoreConfig::InMemory);
        store.init().await.unwrap();
        for lines in datasets {
            store.commit_dataset(rows(lines)).await.unwrap();
        }
        store
    }

    #[test]
    fn test_coerce_field() {
        assert_eq!(coerce_field("42"), 42.0);
        assert_eq!(coerce_field(" 60\r"), 60.0);
        assert_eq!(coerce_field(""), 0.0);
        assert_eq!(coerce_field("-1.5e3"), -1500.0);
        assert_eq!(coerce_field("0x1F"), 31.0);
        assert_eq!(coerce_field("0b101"), 5.0);
        assert_eq!(coerce_field("-Infinity"), f64::NEG_INFINITY);
        assert!(coerce_field("abc").is_nan());
        assert!(coerce_field("inf").is_nan());
        assert!(coerce_field("NaN").is_nan());
        assert!(coerce_field("0x").is_nan());
        assert!(coerce_field("1,2").is_nan());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(123_456.0), "123456");
    }

    #[test]
    fn test_dataset_to_csv() {
        let csv = dataset_to_csv(&rows(&["1,10,20,30,40,50,60", "2,11,21,31,41,51,61"]));
        assert_eq!(
            csv,
            "Counter,Channel 1,Channel 2,Channel 3,Channel 4,Channel 5,Channel 6\n\
             1,10,20,30,40,50,60\n\
             2,11,21,31,41,51,61"
        );
    }

    #[test]
    fn test_csv_keeps_malformed_fields_as_nan() {
        let csv = dataset_to_csv(&rows(&["3,x,7"]));
        assert!(csv.ends_with("\n3,NaN,7"));
    }

    #[test]
    fn test_empty_dataset_is_header_only() {
        assert_eq!(dataset_to_csv(&[]), COLUMN_NAMES.join(","));
    }

    #[test]
    fn test_rows_to_dataframe() {
        let df = rows_to_dataframe(&rows(&["1,10,20,30,40,50,60", "2,11"])).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 7);
        let channel_1 = df.column("Channel 1").unwrap().f64().unwrap();
        assert_eq!(channel_1.get(0), Some(10.0));
        assert_eq!(channel_1.get(1), Some(11.0));
        let channel_6 = df.column("Channel 6").unwrap().f64().unwrap();
        assert_eq!(channel_6.get(1), None);
    }

    #[test]
    fn test_package_nothing() {
        assert!(matches!(package(&[]), Err(ExportError::NoData)));
    }

    #[tokio::test]
    async fn test_export_with_no_datasets_leaves_store_unchanged() {
        let store = store_with(&[]).await;
        store.append_to_buffer(&rows(&["1,2"])).await.unwrap();
        let sink = CollectingSink::default();

        let result = ExportPipeline::new(&store).export_all(&sink).await;
        assert!(matches!(result, Err(ExportError::NoData)));
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(store.get_buffer().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_export_single_dataset_as_csv() {
        let store = store_with(&[&["1,10,20,30,40,50,60"]]).await;
        let sink = CollectingSink::default();

        let report = ExportPipeline::new(&store).export_all(&sink).await.unwrap();
        assert_eq!(report.file_name, "data.csv");
        assert_eq!(report.datasets, 1);

        let delivered = sink.delivered.lock();
        let ExportArtifact::Csv { contents } = &delivered[0] else {
            panic!("expected a csv file");
        };
        assert!(contents.ends_with("\n1,10,20,30,40,50,60"));
        assert_eq!(delivered[0].mime_type(), "text/csv;charset=utf-8");
        drop(delivered);

        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_many_datasets_as_archive() {
        let store = store_with(&[&["1,10"], &["1,20", "2,21"], &["1,30"]]).await;
        let sink = CollectingSink::default();

        let report = ExportPipeline::new(&store).export_all(&sink).await.unwrap();
        assert_eq!(report.file_name, "datasets.zip");
        assert_eq!(report.datasets, 3);
        assert_eq!(store.count().await.unwrap(), 0);

        let delivered = sink.delivered.lock();
        let mut archive = zip::ZipArchive::new(Cursor::new(delivered[0].bytes().to_vec())).unwrap();
        assert_eq!(archive.len(), 3);

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["data1.csv", "data2.csv", "data3.csv"]);

        let mut second = String::new();
        archive
            .by_name("data2.csv")
            .unwrap()
            .read_to_string(&mut second)
            .unwrap();
        assert!(second.ends_with("\n1,20\n2,21"));
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_datasets() {
        let store = store_with(&[&["1,10"], &["1,20"]]).await;
        let result = ExportPipeline::new(&store).export_all(&FailingSink).await;
        assert!(matches!(result, Err(ExportError::Io(_))));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_directory_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let artifact = ExportArtifact::Csv {
            contents: "Counter\n1".into(),
        };
        sink.deliver(&artifact).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("data.csv")).unwrap();
        assert_eq!(written, "Counter\n1");
    }

    #[tokio::test]
    async fn test_export_before_init_is_not_ready() {
        let store = DatasetStore::new(StoreConfig::InMemory);
        let result = ExportPipeline::new(&store)
            .export_all(&CollectingSink::default())
            .await;
        assert!(matches!(result, Err(ExportError::Store(StoreError::NotReady))));
    }
}
