//! Session archive
//!
//! Finished sessions are appended as JSON lines to `sessions.log`:
//! - one line per terminal session
//! - unparseable lines are skipped on reload (torn tail after a crash)
//! - configurable sync policy

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::SessionSummary;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O: {0}")]
    Io(#[from] io::Error),

    #[error("archive encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Archive configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding `sessions.log`
    pub dir: PathBuf,
    /// Sync to disk after every record
    pub fsync_on_write: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./moovolt-data"),
            fsync_on_write: true,
        }
    }
}

impl ArchiveConfig {
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_fsync(mut self, fsync_on_write: bool) -> Self {
        self.fsync_on_write = fsync_on_write;
        self
    }
}

/// Where finished sessions end up
pub trait SessionArchive: Send + Sync {
    fn record(&self, summary: &SessionSummary) -> Result<(), ArchiveError>;

    fn load_all(&self) -> Result<Vec<SessionSummary>, ArchiveError>;
}

/// Append-only JSON lines file
pub struct FileArchive {
    config: ArchiveConfig,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileArchive {
    pub fn open(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        fs::create_dir_all(&config.dir)?;
        let path = config.dir.join("sessions.log");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Archive: opened {:?} (size={})", path, file.metadata()?.len());

        Ok(Self {
            config,
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl SessionArchive for FileArchive {
    fn record(&self, summary: &SessionSummary) -> Result<(), ArchiveError> {
        let data = serde_json::to_string(summary)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", data)?;
        writer.flush()?;
        if self.config.fsync_on_write {
            writer.get_ref().sync_data()?;
        }

        debug!("Archive: recorded session {} ({})", summary.session_id, summary.state);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SessionSummary>, ArchiveError> {
        self.writer.lock().flush()?;

        let reader = BufReader::new(File::open(&self.path)?);
        let mut summaries = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line_num = index + 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Archive: read error at line {}: {}", line_num, e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<SessionSummary>(&line) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("Archive: parse error at line {}: {}", line_num, e),
            }
        }

        info!("Archive: loaded {} sessions from {:?}", summaries.len(), self.path);
        Ok(summaries)
    }
}

/// In-memory archive for testing
#[derive(Default)]
pub struct MemoryArchive {
    summaries: Mutex<Vec<SessionSummary>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.summaries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.lock().is_empty()
    }
}

impl SessionArchive for MemoryArchive {
    fn record(&self, summary: &SessionSummary) -> Result<(), ArchiveError> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<SessionSummary>, ArchiveError> {
        Ok(self.summaries.lock().clone())
    }
}
