//! Append-only on-disk history of log records.
//!
//! One JSON object per line in `history_<date>.jsonl` files under the data
//! directory. The current file rotates to a `<date>_<time>` name when it
//! reaches `max_lines`, and the oldest files beyond `max_files` are deleted.
//! Files are never rewritten in place.

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{WiretapError, WiretapResult};
use crate::logger::models::LogRecord;

/// Default cap on retained files
pub const DEFAULT_MAX_FILES: usize = 10;
/// Default lines per file before rotation
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Tail reads hold at most this many lines of one file in memory
const TAIL_WINDOW: usize = 1000;

struct JournalState {
    current_path: PathBuf,
    line_count: usize,
}

pub struct Journal {
    data_dir: PathBuf,
    max_files: usize,
    max_lines: usize,
    state: RwLock<JournalState>,
}

impl Journal {
    /// Open (or create) a journal in `data_dir`. The current file's line
    /// count is established once here and tracked in memory afterwards.
    pub async fn new(
        data_dir: impl Into<PathBuf>,
        max_files: usize,
        max_lines: usize,
    ) -> WiretapResult<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| WiretapError::journal(format!("create data dir: {}", e)))?;

        let current_path = data_dir.join(dated_filename());
        let line_count = count_lines(&current_path).await.unwrap_or(0);

        debug!(
            "Journal opened at {:?} ({} existing lines)",
            current_path, line_count
        );

        Ok(Self {
            data_dir,
            max_files: max_files.max(1),
            max_lines: max_lines.max(1),
            state: RwLock::new(JournalState {
                current_path,
                line_count,
            }),
        })
    }

    pub async fn with_defaults(data_dir: impl Into<PathBuf>) -> WiretapResult<Self> {
        Self::new(data_dir, DEFAULT_MAX_FILES, DEFAULT_MAX_LINES).await
    }

    /// Append one record, rotating first when the current file is full.
    pub async fn append(&self, record: &LogRecord) -> WiretapResult<()> {
        let line = serde_json::to_string(record)?;

        let mut state = self.state.write().await;

        if state.line_count >= self.max_lines {
            let rotated = self.data_dir.join(rotated_filename());
            debug!("Journal rotating to {:?}", rotated);
            state.current_path = rotated;
            state.line_count = 0;

            if let Err(e) = self.cleanup_old_files(&state.current_path).await {
                warn!("Failed to clean up old journal files: {}", e);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.current_path)
            .await
            .map_err(|e| WiretapError::journal(format!("open journal file: {}", e)))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| WiretapError::journal(format!("write journal line: {}", e)))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| WiretapError::journal(format!("write journal line: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| WiretapError::journal(format!("flush journal: {}", e)))?;

        state.line_count += 1;
        Ok(())
    }

    /// Most recent records, newest first. Walks from the current file into
    /// older files until `limit` is met or files run out.
    pub async fn recent(&self, limit: usize) -> WiretapResult<Vec<LogRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut records = read_tail(&state.current_path, limit).await?;

        if records.len() < limit {
            let files = self.list_files().await?;
            for file in files.iter().rev() {
                if *file == state.current_path {
                    continue;
                }
                if records.len() >= limit {
                    break;
                }
                match read_tail(file, limit - records.len()).await {
                    Ok(older) => records.extend(older),
                    Err(e) => {
                        warn!("Skipping unreadable journal file {:?}: {}", file, e);
                    }
                }
            }
        }

        records.truncate(limit);
        Ok(records)
    }

    /// Delete every journal file and point at a fresh date-stamped file.
    pub async fn clear(&self) -> WiretapResult<()> {
        let mut state = self.state.write().await;

        for file in self.list_files().await? {
            if let Err(e) = tokio::fs::remove_file(&file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(WiretapError::journal(format!(
                        "remove journal file {:?}: {}",
                        file, e
                    )));
                }
            }
        }

        state.current_path = self.data_dir.join(dated_filename());
        state.line_count = 0;

        // Leave a fresh, empty current file behind so the directory always
        // reflects where the next record will land.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.current_path)
            .await
            .map_err(|e| WiretapError::journal(format!("create fresh journal file: {}", e)))?;

        Ok(())
    }

    /// All journal files in the data directory, sorted by name ascending
    /// (which is chronological for these filenames).
    async fn list_files(&self) -> WiretapResult<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| WiretapError::journal(format!("read data dir: {}", e)))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WiretapError::journal(format!("read data dir entry: {}", e)))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("history_") && name.ends_with(".jsonl") {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    async fn cleanup_old_files(&self, keep: &Path) -> WiretapResult<()> {
        let files = self.list_files().await?;
        if files.len() <= self.max_files {
            return Ok(());
        }

        for file in &files[..files.len() - self.max_files] {
            if file == keep {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(file).await {
                warn!("Failed to remove old journal file {:?}: {}", file, e);
            } else {
                debug!("Removed old journal file {:?}", file);
            }
        }
        Ok(())
    }

    /// Current file path (diagnostics and tests)
    pub async fn current_path(&self) -> PathBuf {
        self.state.read().await.current_path.clone()
    }

    /// Lines in the current file (diagnostics and tests)
    pub async fn current_line_count(&self) -> usize {
        self.state.read().await.line_count
    }
}

fn dated_filename() -> String {
    format!("history_{}.jsonl", Local::now().format("%Y-%m-%d"))
}

fn rotated_filename() -> String {
    format!("history_{}.jsonl", Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

async fn count_lines(path: &Path) -> WiretapResult<usize> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(WiretapError::journal(format!("open {:?}: {}", path, e))),
    };

    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while lines
        .next_line()
        .await
        .map_err(|e| WiretapError::journal(format!("count lines in {:?}: {}", path, e)))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}

/// Read the newest `limit` parseable records from one file, newest first.
/// Only the last `TAIL_WINDOW` lines are held in memory; unparseable lines
/// are skipped silently.
async fn read_tail(path: &Path, limit: usize) -> WiretapResult<Vec<LogRecord>> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WiretapError::journal(format!("open {:?}: {}", path, e))),
    };

    let mut ring: Vec<String> = vec![String::new(); TAIL_WINDOW];
    let mut total = 0usize;

    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| WiretapError::journal(format!("read {:?}: {}", path, e)))?
    {
        ring[total % TAIL_WINDOW] = line;
        total += 1;
    }

    let kept = total.min(TAIL_WINDOW);
    let mut records = Vec::new();

    // Walk the ring backwards from the newest line
    for i in 0..kept {
        if records.len() >= limit {
            break;
        }
        let idx = (total - 1 - i) % TAIL_WINDOW;
        match serde_json::from_str::<LogRecord>(&ring[idx]) {
            Ok(record) => records.push(record),
            Err(_) => continue,
        }
    }

    Ok(records)
}
