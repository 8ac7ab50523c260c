//! Checkpoint files
//!
//! One file per state provider holds its committed records as of a
//! checkpoint LSN; one metadata file holds the state manager's namespace.
//!
//! ## Provider Checkpoint Layout
//!
//! ```text
//! +----------------------+
//! | Magic (8 bytes)      |  "RSTCHKPT"
//! +----------------------+
//! | Format version (4)   |  1
//! +----------------------+
//! | Flags (4)            |  FLAG_SORTED
//! +----------------------+
//! | Provider id (8)      |
//! +----------------------+
//! | Checkpoint LSN (8)   |
//! +----------------------+
//! | Record count (8)     |
//! +----------------------+
//! | Records              |  bincode Vec<CheckpointRecord>
//! +----------------------+
//! | CRC32 (4)            |  Checksum of everything above
//! +----------------------+
//! ```
//!
//! The metadata file uses the same envelope with magic `"RSTSMETA"` and a
//! bincode [`MetadataCheckpoint`] body.
//!
//! Files are written next to their final name with a `.next` suffix and
//! published by rename, so a failed write never damages the previous
//! baseline.

use replistate_core::{Epoch, Lsn, StateError, StateProviderId, StateResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Provider checkpoint magic
pub const PROVIDER_MAGIC: &[u8; 8] = b"RSTCHKPT";

/// Metadata checkpoint magic
pub const METADATA_MAGIC: &[u8; 8] = b"RSTSMETA";

/// Current checkpoint format version
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Records are stored in ascending key order
pub const FLAG_SORTED: u32 = 0x1;

/// Magic(8) + Version(4) + Flags(4) + ProviderId(8) + Lsn(8) + Count(8)
pub const PROVIDER_HEADER_SIZE: usize = 40;

/// Magic(8) + Version(4)
const METADATA_HEADER_SIZE: usize = 12;

/// One committed record in a provider checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Encoded key
    pub key: Vec<u8>,
    /// Commit LSN of the value
    pub version: Lsn,
    /// Encoded value
    pub value: Vec<u8>,
}

/// Provider checkpoint header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Format version
    pub format_version: u32,
    /// Flags
    pub flags: u32,
    /// Provider the records belong to
    pub provider_id: StateProviderId,
    /// Every record has `version <= checkpoint_lsn`
    pub checkpoint_lsn: Lsn,
    /// Number of records
    pub record_count: u64,
}

impl CheckpointHeader {
    /// Header for a sorted checkpoint of `record_count` records
    pub fn new(provider_id: StateProviderId, checkpoint_lsn: Lsn, record_count: u64) -> Self {
        CheckpointHeader {
            format_version: CHECKPOINT_FORMAT_VERSION,
            flags: FLAG_SORTED,
            provider_id,
            checkpoint_lsn,
            record_count,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; PROVIDER_HEADER_SIZE] {
        let mut buf = [0u8; PROVIDER_HEADER_SIZE];
        buf[0..8].copy_from_slice(PROVIDER_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.provider_id.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.checkpoint_lsn.as_i64().to_le_bytes());
        buf[32..40].copy_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> StateResult<Self> {
        if data.len() < PROVIDER_HEADER_SIZE {
            return Err(StateError::corruption(format!(
                "checkpoint too short: {} bytes",
                data.len()
            )));
        }
        if &data[0..8] != PROVIDER_MAGIC {
            return Err(StateError::corruption("invalid checkpoint magic"));
        }
        let format_version = read_u32(&data[8..12]);
        if format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(StateError::corruption(format!(
                "unsupported checkpoint format version {}",
                format_version
            )));
        }
        Ok(CheckpointHeader {
            format_version,
            flags: read_u32(&data[12..16]),
            provider_id: StateProviderId(read_i64(&data[16..24])),
            checkpoint_lsn: Lsn::new(read_i64(&data[24..32])),
            record_count: read_i64(&data[32..40]) as u64,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

/// Parsed provider checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCheckpoint {
    /// Header
    pub header: CheckpointHeader,
    /// Records in ascending key order
    pub records: Vec<CheckpointRecord>,
}

/// Namespace entry in the metadata checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Full state provider name
    pub name: String,
    /// Provider id
    pub id: StateProviderId,
    /// Encoded type descriptor
    pub type_descriptor: String,
    /// Owning provider for children of compound providers
    pub parent_id: Option<StateProviderId>,
}

/// State manager metadata checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCheckpoint {
    /// Checkpoint boundary
    pub checkpoint_lsn: Lsn,
    /// Epoch at the boundary
    pub epoch: Epoch,
    /// Next provider id to hand out
    pub next_provider_id: StateProviderId,
    /// Registered providers
    pub entries: Vec<MetadataEntry>,
}

/// Information about a written checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointFileInfo {
    /// Where it was written
    pub path: PathBuf,
    /// Size in bytes
    pub size_bytes: u64,
}

fn write_synced(path: &Path, chunks: &[&[u8]]) -> StateResult<CheckpointFileInfo> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut hasher = crc32fast::Hasher::new();
    let mut file = File::create(path)?;
    for chunk in chunks {
        file.write_all(chunk)?;
        hasher.update(chunk);
    }
    file.write_all(&hasher.finalize().to_le_bytes())?;
    file.sync_all()?;
    let size_bytes = std::fs::metadata(path)?.len();
    Ok(CheckpointFileInfo {
        path: path.to_path_buf(),
        size_bytes,
    })
}

fn validate_checksum(data: &[u8], min_len: usize) -> StateResult<&[u8]> {
    if data.len() < min_len + 4 {
        return Err(StateError::corruption(format!(
            "checkpoint too short: expected at least {} bytes, got {}",
            min_len + 4,
            data.len()
        )));
    }
    let (content, checksum) = data.split_at(data.len() - 4);
    let stored = read_u32(checksum);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(StateError::corruption(format!(
            "checkpoint checksum mismatch: expected {:08x}, got {:08x}",
            stored, computed
        )));
    }
    Ok(content)
}

/// Write a provider checkpoint file and sync it
pub fn write_provider_checkpoint(
    path: &Path,
    provider_id: StateProviderId,
    checkpoint_lsn: Lsn,
    records: &[CheckpointRecord],
) -> StateResult<CheckpointFileInfo> {
    let header = CheckpointHeader::new(provider_id, checkpoint_lsn, records.len() as u64);
    let body = bincode::serialize(records)?;
    let info = write_synced(path, &[&header.to_bytes(), &body])?;
    debug!(
        path = %path.display(),
        provider = %provider_id,
        checkpoint_lsn = %checkpoint_lsn,
        records = records.len(),
        size_bytes = info.size_bytes,
        "Provider checkpoint written"
    );
    Ok(info)
}

/// Read and validate a provider checkpoint file
pub fn read_provider_checkpoint(path: &Path) -> StateResult<ProviderCheckpoint> {
    let data = std::fs::read(path)?;
    let content = validate_checksum(&data, PROVIDER_HEADER_SIZE)?;
    let header = CheckpointHeader::from_bytes(content)?;
    let records: Vec<CheckpointRecord> = bincode::deserialize(&content[PROVIDER_HEADER_SIZE..])
        .map_err(|e| StateError::corruption(format!("checkpoint records: {}", e)))?;
    if records.len() as u64 != header.record_count {
        return Err(StateError::corruption(format!(
            "checkpoint record count mismatch: header says {}, found {}",
            header.record_count,
            records.len()
        )));
    }
    Ok(ProviderCheckpoint { header, records })
}

/// Write the state manager metadata checkpoint and sync it
pub fn write_metadata_checkpoint(
    path: &Path,
    metadata: &MetadataCheckpoint,
) -> StateResult<CheckpointFileInfo> {
    let mut header = [0u8; METADATA_HEADER_SIZE];
    header[0..8].copy_from_slice(METADATA_MAGIC);
    header[8..12].copy_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    let body = bincode::serialize(metadata)?;
    write_synced(path, &[&header, &body])
}

/// Read and validate the state manager metadata checkpoint
pub fn read_metadata_checkpoint(path: &Path) -> StateResult<MetadataCheckpoint> {
    let data = std::fs::read(path)?;
    let content = validate_checksum(&data, METADATA_HEADER_SIZE)?;
    if &content[0..8] != METADATA_MAGIC {
        return Err(StateError::corruption("invalid metadata checkpoint magic"));
    }
    let version = read_u32(&content[8..12]);
    if version != CHECKPOINT_FORMAT_VERSION {
        return Err(StateError::corruption(format!(
            "unsupported metadata checkpoint version {}",
            version
        )));
    }
    bincode::deserialize(&content[METADATA_HEADER_SIZE..])
        .map_err(|e| StateError::corruption(format!("metadata checkpoint: {}", e)))
}

/// Publish a staged file under its final name
pub fn publish(staged: &Path, current: &Path) -> StateResult<()> {
    if let Err(e) = std::fs::rename(staged, current) {
        warn!(
            staged = %staged.display(),
            current = %current.display(),
            error = %e,
            "Publishing checkpoint failed"
        );
        return Err(StateError::Io(e));
    }
    Ok(())
}

/// Checkpoint directory layout
///
/// ```text
/// checkpoint/
/// ├── sm.chk          # state manager metadata
/// ├── sm.chk.next     # staged by perform, renamed by complete
/// ├── 1.chk           # provider 1
/// └── 1.chk.next
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    dir: PathBuf,
}

const METADATA_FILE: &str = "sm.chk";
const STAGED_SUFFIX: &str = "next";

impl CheckpointLayout {
    /// Layout rooted at `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        CheckpointLayout {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory
    pub fn create(&self) -> StateResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Published metadata checkpoint
    pub fn metadata(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Staged metadata checkpoint
    pub fn metadata_staged(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", METADATA_FILE, STAGED_SUFFIX))
    }

    /// Published checkpoint of provider `id`
    pub fn provider(&self, id: StateProviderId) -> PathBuf {
        self.dir.join(format!("{}.chk", id.0))
    }

    /// Staged checkpoint of provider `id`
    pub fn provider_staged(&self, id: StateProviderId) -> PathBuf {
        self.dir.join(format!("{}.chk.{}", id.0, STAGED_SUFFIX))
    }

    /// Whether a published metadata checkpoint exists
    pub fn has_checkpoint(&self) -> bool {
        self.metadata().exists()
    }

    /// Remove staged files left by an interrupted checkpoint
    pub fn remove_staged(&self) -> StateResult<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STAGED_SUFFIX) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(dir = %self.dir.display(), removed, "Removed staged checkpoint files");
        }
        Ok(removed)
    }

    /// Remove published provider files whose ids are not in `live`
    pub fn remove_orphans(&self, live: &[StateProviderId]) -> StateResult<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let stem_id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".chk"))
                .and_then(|n| n.parse::<i64>().ok());
            if let Some(id) = stem_id {
                if !live.contains(&StateProviderId(id)) {
                    std::fs::remove_file(&path)?;
                    debug!(path = %path.display(), "Removed orphaned provider checkpoint");
                }
            }
        }
        Ok(())
    }

    /// Copy every published checkpoint file into `dest`
    pub fn copy_published(&self, dest: &Path) -> StateResult<usize> {
        std::fs::create_dir_all(dest)?;
        let mut copied = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("chk") {
                if let Some(name) = path.file_name() {
                    std::fs::copy(&path, dest.join(name))?;
                    copied += 1;
                }
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records() -> Vec<CheckpointRecord> {
        vec![
            CheckpointRecord {
                key: b"a".to_vec(),
                version: Lsn::new(1),
                value: b"1".to_vec(),
            },
            CheckpointRecord {
                key: b"b".to_vec(),
                version: Lsn::new(4),
                value: b"2".to_vec(),
            },
        ]
    }

    #[test]
    fn test_provider_checkpoint_write_read() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path());
        let path = layout.provider(StateProviderId(3));
        write_provider_checkpoint(&path, StateProviderId(3), Lsn::new(4), &records()).unwrap();

        let checkpoint = read_provider_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.header.provider_id, StateProviderId(3));
        assert_eq!(checkpoint.header.checkpoint_lsn, Lsn::new(4));
        assert_eq!(checkpoint.header.flags, FLAG_SORTED);
        assert_eq!(checkpoint.records, records());
    }

    #[test]
    fn test_provider_checkpoint_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.chk");
        write_provider_checkpoint(&path, StateProviderId(1), Lsn::new(4), &records()).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[PROVIDER_HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let err = read_provider_checkpoint(&path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_metadata_checkpoint_write_read() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path());
        let metadata = MetadataCheckpoint {
            checkpoint_lsn: Lsn::new(9),
            epoch: Epoch::new(1, 2),
            next_provider_id: StateProviderId(4),
            entries: vec![MetadataEntry {
                name: "fabric:/app/orders".to_string(),
                id: StateProviderId(1),
                type_descriptor: "0\u{1}\u{1}\n".to_string(),
                parent_id: None,
            }],
        };
        write_metadata_checkpoint(&layout.metadata_staged(), &metadata).unwrap();
        assert!(!layout.has_checkpoint());
        publish(&layout.metadata_staged(), &layout.metadata()).unwrap();
        assert!(layout.has_checkpoint());
        assert_eq!(read_metadata_checkpoint(&layout.metadata()).unwrap(), metadata);
    }

    #[test]
    fn test_staged_file_does_not_replace_baseline() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path());
        let id = StateProviderId(2);
        write_provider_checkpoint(&layout.provider(id), id, Lsn::new(1), &records()[..1]).unwrap();
        write_provider_checkpoint(&layout.provider_staged(id), id, Lsn::new(4), &records()).unwrap();

        assert_eq!(layout.remove_staged().unwrap(), 1);
        let baseline = read_provider_checkpoint(&layout.provider(id)).unwrap();
        assert_eq!(baseline.header.checkpoint_lsn, Lsn::new(1));
    }

    #[test]
    fn test_remove_orphans_and_copy() {
        let dir = TempDir::new().unwrap();
        let layout = CheckpointLayout::new(dir.path().join("chk"));
        layout.create().unwrap();
        for id in [1, 2] {
            let id = StateProviderId(id);
            write_provider_checkpoint(&layout.provider(id), id, Lsn::new(1), &[]).unwrap();
        }
        layout.remove_orphans(&[StateProviderId(1)]).unwrap();
        assert!(layout.provider(StateProviderId(1)).exists());
        assert!(!layout.provider(StateProviderId(2)).exists());

        let dest = dir.path().join("copy");
        assert_eq!(layout.copy_published(&dest).unwrap(), 1);
        assert!(dest.join("1.chk").exists());
    }
}
