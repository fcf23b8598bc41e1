//! Bet storage backends.
//!
//! The server only needs two operations from a store: append a session's
//! records, and load everything back once for the draw. Both are blocking
//! and either succeed or fail as a whole.

use crate::bet::{BetRecord, InvalidBetFormat};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bet store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt bet store at line {line_number}: {source}")]
    Corrupt {
        line_number: usize,
        source: InvalidBetFormat,
    },
}

/// Append-only collection of every bet received.
pub trait BetStore: Send {
    /// Durably record `records`, in order.
    fn append(&mut self, records: &[BetRecord]) -> Result<(), StoreError>;

    /// Every record ever appended, in append order.
    fn load_all(&self) -> Result<Vec<BetRecord>, StoreError>;
}

/// In-memory store, used when no bets file is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<BetRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BetStore for MemoryStore {
    fn append(&mut self, records: &[BetRecord]) -> Result<(), StoreError> {
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<BetRecord>, StoreError> {
        Ok(self.records.clone())
    }
}

/// Store that appends one comma-separated line per record to a file.
#[derive(Debug)]
pub struct CsvFileStore {
    path: PathBuf,
}

impl CsvFileStore {
    /// Open (creating if needed) the bets file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Using bets file");
        Ok(Self { path })
    }
}

impl BetStore for CsvFileStore {
    fn append(&mut self, records: &[BetRecord]) -> Result<(), StoreError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            writeln!(writer, "{record}")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;

        debug!(count = records.len(), "Bets appended to file");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<BetRecord>, StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = BetRecord::parse_line(&line).map_err(|source| StoreError::Corrupt {
                line_number: index + 1,
                source,
            })?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Open the configured store: the CSV file if a path is given, memory otherwise.
pub fn open_store(bets_file: Option<&Path>) -> Result<Box<dyn BetStore>, StoreError> {
    match bets_file {
        Some(path) => Ok(Box::new(CsvFileStore::open(path)?)),
        None => {
            info!("Using in-memory bet store");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(agency: &str, document: &str) -> BetRecord {
        BetRecord::parse_line(&format!("{agency},Ana,Gomez,{document},1990-05-06,7574")).unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "lottery-server-{}-{}.csv",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_memory_store_append_order() {
        let mut store = MemoryStore::new();
        store.append(&[record("1", "10"), record("1", "11")]).unwrap();
        store.append(&[record("2", "20")]).unwrap();

        let all = store.load_all().unwrap();
        let documents: Vec<&str> = all.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(documents, vec!["10", "11", "20"]);
    }

    #[test]
    fn test_memory_store_empty() {
        let store = MemoryStore::new();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_round_trip() {
        let path = temp_path("round-trip");
        let mut store = CsvFileStore::open(&path).unwrap();
        assert!(store.load_all().unwrap().is_empty());

        let first = vec![record("1", "10"), record("2", "20")];
        store.append(&first).unwrap();
        store.append(&[record("3", "30")]).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[..2], first[..]);
        assert_eq!(all[2].agency_id, "3");

        // A reopened store sees what was written before.
        let reopened = CsvFileStore::open(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap().len(), 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_store_selects_backend() {
        let mut memory = open_store(None).unwrap();
        memory.append(&[record("1", "10")]).unwrap();
        assert_eq!(memory.load_all().unwrap().len(), 1);

        let path = temp_path("open-store");
        let mut file = open_store(Some(path.as_path())).unwrap();
        file.append(&[record("1", "10")]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1,Ana,Gomez,10,1990-05-06,7574\n");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_file_store_corrupt_line() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "1,Ana,Gomez,10,1990-05-06,7574\nbroken line\n").unwrap();

        let store = CsvFileStore::open(&path).unwrap();
        match store.load_all() {
            Err(StoreError::Corrupt { line_number, .. }) => assert_eq!(line_number, 2),
            other => panic!("Expected Corrupt, got {other:?}"),
        }

        std::fs::remove_file(&path).unwrap();
    }
}
