use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A pluggable key/value record store backed by flat JSON files:
/// `<dir>/records/<first-2-hex>/<sha256-of-key>.json`. Writes go through a
/// temp file and a rename, so readers never observe a torn record.
pub struct RecordStore {
    records_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    updated_at_ms: u64,
    value: serde_json::Value,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RecordStore {
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let records_dir = dir.as_ref().join("records");
        std::fs::create_dir_all(&records_dir)?;
        Ok(Self { records_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.records_dir.join(&digest[..2]).join(format!("{digest}.json"))
    }

    pub fn put(&self, key: &str, value: serde_json::Value) -> std::io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = Record {
            key: key.to_string(),
            updated_at_ms: now_ms(),
            value,
        };
        let body = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)?;
        std::fs::rename(&tmp, &path)
    }

    /// Returns the value and its wall-clock write time.
    pub fn get(&self, key: &str) -> std::io::Result<Option<(serde_json::Value, SystemTime)>> {
        let path = self.path_for(key);
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record: Record = serde_json::from_slice(&body)?;
        let when = UNIX_EPOCH + std::time::Duration::from_millis(record.updated_at_ms);
        Ok(Some((record.value, when)))
    }

    pub fn delete(&self, key: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
