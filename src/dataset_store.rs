//! Persistent recording buffer and finalized datasets.
//!
//! [`DatasetStore`] fronts a [`RecordStore`] backend. It must be initialized
//! once with [`DatasetStore::init`]; until then every operation fails with
//! [`StoreError::NotReady`].

use crate::export::{dataset_to_csv, rows_to_dataframe};
use crate::sample_router::SampleRow;
use async_trait::async_trait;
use parking_lot::Mutex;
use polars::prelude::{DataFrame, PolarsError};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Data storage is not ready")]
    NotReady,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetId(pub i64);

/// One completed recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    id: DatasetId,
    rows: Vec<SampleRow>,
}

impl Dataset {
    pub fn new(id: DatasetId, rows: Vec<SampleRow>) -> Self {
        Self { id, rows }
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn rows(&self) -> &[SampleRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_csv(&self) -> String {
        dataset_to_csv(&self.rows)
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        rows_to_dataframe(&self.rows)
    }
}

/// Result of moving the buffer into a new dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedDataset {
    pub id: DatasetId,
    pub rows: usize,
}

/// Backing storage for the buffer and the dataset collection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append_to_buffer(&self, rows: &[SampleRow]) -> Result<(), StoreError>;

    async fn buffer(&self) -> Result<Vec<SampleRow>, StoreError>;

    async fn clear_buffer(&self) -> Result<(), StoreError>;

    async fn commit_dataset(&self, rows: Vec<SampleRow>) -> Result<DatasetId, StoreError>;

    /// Datasets in commit order.
    async fn datasets(&self) -> Result<Vec<Dataset>, StoreError>;

    async fn remove_datasets(&self, ids: &[DatasetId]) -> Result<(), StoreError>;

    async fn clear_datasets(&self) -> Result<(), StoreError>;

    async fn dataset_count(&self) -> Result<usize, StoreError>;

    /// Move the whole buffer into a new dataset and empty it.
    async fn commit_buffer(&self) -> Result<CommittedDataset, StoreError> {
        let rows = self.buffer().await?;
        let count = rows.len();
        let id = self.commit_dataset(rows).await?;
        self.clear_buffer().await?;
        Ok(CommittedDataset { id, rows: count })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    buffer: Vec<SampleRow>,
    datasets: Vec<Dataset>,
    next_id: i64,
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append_to_buffer(&self, rows: &[SampleRow]) -> Result<(), StoreError> {
        self.state.lock().buffer.extend_from_slice(rows);
        Ok(())
    }

    async fn buffer(&self) -> Result<Vec<SampleRow>, StoreError> {
        Ok(self.state.lock().buffer.clone())
    }

    async fn clear_buffer(&self) -> Result<(), StoreError> {
        self.state.lock().buffer.clear();
        Ok(())
    }

    async fn commit_dataset(&self, rows: Vec<SampleRow>) -> Result<DatasetId, StoreError> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = DatasetId(state.next_id);
        state.datasets.push(Dataset::new(id, rows));
        Ok(id)
    }

    async fn datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        Ok(self.state.lock().datasets.clone())
    }

    async fn remove_datasets(&self, ids: &[DatasetId]) -> Result<(), StoreError> {
        self.state.lock().datasets.retain(|d| !ids.contains(&d.id));
        Ok(())
    }

    async fn clear_datasets(&self) -> Result<(), StoreError> {
        self.state.lock().datasets.clear();
        Ok(())
    }

    async fn dataset_count(&self) -> Result<usize, StoreError> {
        Ok(self.state.lock().datasets.len())
    }

    async fn commit_buffer(&self) -> Result<CommittedDataset, StoreError> {
        let mut state = self.state.lock();
        let rows = std::mem::take(&mut state.buffer);
        let count = rows.len();
        state.next_id += 1;
        let id = DatasetId(state.next_id);
        state.datasets.push(Dataset::new(id, rows));
        Ok(CommittedDataset { id, rows: count })
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS buffer_rows (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    line TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset_rows (
    dataset_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    line TEXT NOT NULL,
    PRIMARY KEY (dataset_id, seq)
);
";

// Fields never contain commas (they were split on them), so a row is stored
// as its comma-joined line and split again on load.
fn row_from_line(line: &str) -> Option<SampleRow> {
    let row = SampleRow::parse(line);
    if row.is_none() {
        log::warn!("Skipping stored row with fewer than two fields: {line:?}");
    }
    row
}

/// SQLite-backed store; survives restarts.
///
/// `rusqlite::Connection` is `!Sync`, so it sits behind a mutex and every
/// query runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) the database file. Blocking.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // WAL for concurrent read/write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        log::debug!("Opened dataset store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?;
        Ok(result?)
    }

    fn insert_dataset(conn: &Connection) -> rusqlite::Result<DatasetId> {
        conn.execute(
            "INSERT INTO datasets (created_at) VALUES (?1)",
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(DatasetId(conn.last_insert_rowid()))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn append_to_buffer(&self, rows: &[SampleRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = rows.iter().map(SampleRow::to_line).collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached("INSERT INTO buffer_rows (line) VALUES (?1)")?;
                for line in &lines {
                    stmt.execute(params![line])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn buffer(&self) -> Result<Vec<SampleRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT line FROM buffer_rows ORDER BY seq")?;
            let lines = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(lines.iter().filter_map(|l| row_from_line(l)).collect())
        })
        .await
    }

    async fn clear_buffer(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute("DELETE FROM buffer_rows", []).map(|_| ()))
            .await
    }

    async fn commit_dataset(&self, rows: Vec<SampleRow>) -> Result<DatasetId, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = Self::insert_dataset(&tx)?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO dataset_rows (dataset_id, seq, line) VALUES (?1, ?2, ?3)",
                )?;
                for (seq, row) in rows.iter().enumerate() {
                    stmt.execute(params![id.0, seq as i64, row.to_line()])?;
                }
            }
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        self.with_conn(|conn| {
            let ids = conn
                .prepare_cached("SELECT id FROM datasets ORDER BY id")?
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare_cached(
                "SELECT line FROM dataset_rows WHERE dataset_id = ?1 ORDER BY seq",
            )?;
            let mut datasets = Vec::with_capacity(ids.len());
            for id in ids {
                let lines = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let rows = lines.iter().filter_map(|l| row_from_line(l)).collect();
                datasets.push(Dataset::new(DatasetId(id), rows));
            }
            Ok(datasets)
        })
        .await
    }

    async fn remove_datasets(&self, ids: &[DatasetId]) -> Result<(), StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute("DELETE FROM dataset_rows WHERE dataset_id = ?1", params![id])?;
                tx.execute("DELETE FROM datasets WHERE id = ?1", params![id])?;
            }
            tx.commit()
        })
        .await
    }

    async fn clear_datasets(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("DELETE FROM dataset_rows; DELETE FROM datasets;")
        })
        .await
    }

    async fn dataset_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM datasets", [], |row| row.get::<_, i64>(0))
                .map(|n| usize::try_from(n).unwrap_or(0))
        })
        .await
    }

    async fn commit_buffer(&self) -> Result<CommittedDataset, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let id = Self::insert_dataset(&tx)?;
            let rows = tx.execute(
                "INSERT INTO dataset_rows (dataset_id, seq, line)
                 SELECT ?1, seq, line FROM buffer_rows ORDER BY seq",
                params![id.0],
            )?;
            tx.execute("DELETE FROM buffer_rows", [])?;
            tx.commit()?;
            Ok(CommittedDataset { id, rows })
        })
        .await
    }
}

/// Which backend [`DatasetStore::init`] opens.
#[derive(Clone)]
pub enum StoreConfig {
    InMemory,
    Sqlite { path: PathBuf },
    Custom(Arc<dyn RecordStore>),
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory => f.write_str("InMemory"),
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::InMemory
    }
}

pub struct DatasetStore {
    config: StoreConfig,
    backend: OnceCell<Arc<dyn RecordStore>>,
}

impl DatasetStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            backend: OnceCell::new(),
        }
    }

    /// Open the backend. Later calls are no-ops; concurrent callers all wait
    /// for the first one.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.backend
            .get_or_try_init(|| async {
                let backend: Arc<dyn RecordStore> = match &self.config {
                    StoreConfig::InMemory => Arc::new(MemoryRecordStore::new()),
                    StoreConfig::Sqlite { path } => {
                        let path = path.clone();
                        let open = move || SqliteRecordStore::open(&path);
                        Arc::new(tokio::task::spawn_blocking(open).await??)
                    }
                    StoreConfig::Custom(backend) => Arc::clone(backend),
                };
                log::info!("Dataset store initialized ({:?})", self.config);
                Ok::<_, StoreError>(backend)
            })
            .await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.backend.initialized()
    }

    fn backend(&self) -> Result<&Arc<dyn RecordStore>, StoreError> {
        self.backend.get().ok_or(StoreError::NotReady)
    }

    pub async fn append_to_buffer(&self, rows: &[SampleRow]) -> Result<(), StoreError> {
        self.backend()?.append_to_buffer(rows).await
    }

    pub async fn get_buffer(&self) -> Result<Vec<SampleRow>, StoreError> {
        self.backend()?.buffer().await
    }

    pub async fn clear_buffer(&self) -> Result<(), StoreError> {
        self.backend()?.clear_buffer().await
    }

    pub async fn commit_dataset(&self, rows: Vec<SampleRow>) -> Result<DatasetId, StoreError> {
        self.backend()?.commit_dataset(rows).await
    }

    pub async fn commit_buffer(&self) -> Result<CommittedDataset, StoreError> {
        self.backend()?.commit_buffer().await
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>, StoreError> {
        self.backend()?.datasets().await
    }

    pub async fn remove_datasets(&self, ids: &[DatasetId]) -> Result<(), StoreError> {
        self.backend()?.remove_datasets(ids).await
    }

    pub async fn clear_all_datasets(&self) -> Result<(), StoreError> {
        self.backend()?.clear_datasets().await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.backend()?.dataset_count().await
    }
}
