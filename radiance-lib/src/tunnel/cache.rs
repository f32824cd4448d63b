//! The forwarder-owned cache file: last selected mode, per-group selection
//! and URL-test measurements. Binary, must be closed before a restart.

use bincode::{Decode, Encode};
use thiserror::Error;

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::io;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Clone, Debug, Default, PartialEq, Decode, Encode)]
pub struct CacheRecord {
    pub mode: Option<String>,
    /// group tag → selected outbound tag
    pub selected: HashMap<String, String>,
    /// outbound tag → last URL-test round trip in milliseconds
    pub measurements: HashMap<String, u32>,
}

/// Exclusive handle on the cache file while the tunnel runs.
#[derive(Debug)]
pub struct CacheFile {
    path: PathBuf,
    record: CacheRecord,
}

impl CacheFile {
    pub fn open(path: &Path) -> Result<CacheFile, Error> {
        let record = read_record(path)?;
        Ok(CacheFile {
            path: path.to_path_buf(),
            record,
        })
    }

    /// Read-only snapshot without taking ownership; used while the tunnel
    /// is down.
    pub fn peek(path: &Path) -> Result<CacheRecord, Error> {
        read_record(path)
    }

    pub fn record(&self) -> &CacheRecord {
        &self.record
    }

    pub fn set_mode(&mut self, mode: &str) -> Result<(), Error> {
        self.record.mode = Some(mode.to_string());
        self.write()
    }

    pub fn set_selected(&mut self, group: &str, tag: &str) -> Result<(), Error> {
        self.record.selected.insert(group.to_string(), tag.to_string());
        self.write()
    }

    pub fn set_measurement(&mut self, tag: &str, rtt_ms: u32) -> Result<(), Error> {
        self.record.measurements.insert(tag.to_string(), rtt_ms);
        self.write()
    }

    /// Flushes and releases the file.
    pub fn close(self) -> Result<(), Error> {
        self.write()
    }

    fn write(&self) -> Result<(), Error> {
        let mut f = File::create(&self.path)?;
        bincode::encode_into_std_write(&self.record, &mut f, bincode::config::standard())?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<CacheRecord, Error> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheRecord::default()),
        Err(e) => return Err(Error::IO(e)),
    };
    Ok(bincode::decode_from_std_read(&mut f, bincode::config::standard())?)
}

/// Drops a cache file that is no longer wanted.
pub fn remove(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::IO(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_close_and_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lantern.cache");

        let mut cache = CacheFile::open(&path)?;
        cache.set_mode("user")?;
        cache.set_selected("user", "srv7")?;
        cache.set_measurement("srv7", 42)?;
        cache.close()?;

        let record = CacheFile::peek(&path)?;
        assert_eq!(record.mode.as_deref(), Some("user"));
        assert_eq!(record.selected.get("user").map(String::as_str), Some("srv7"));
        assert_eq!(record.measurements.get("srv7"), Some(&42));
        Ok(())
    }

    #[test]
    fn missing_file_reads_as_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let record = CacheFile::peek(&dir.path().join("lantern.cache"))?;
        assert_eq!(record, CacheRecord::default());
        Ok(())
    }

    #[test]
    fn remove_tolerates_absence() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        remove(&dir.path().join("lantern.cache"))?;
        Ok(())
    }
}
