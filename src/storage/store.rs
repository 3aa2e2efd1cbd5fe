//! File Store
//!
//! The on-disk side of a storage server: store-path layout, deterministic
//! filename generation, atomic create/delete, metadata companion files and
//! the appender operations. Remote filenames look like
//! `M00/1a/2b/<stem>.ext`: store-path index, two hash-derived subdirs, then
//! the base64 stem that embeds the creation facts.

use bytes::Bytes;
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::StorageConfig;
use crate::errors::{FastDFSError, Result};
use crate::protocol::{decode_file_meta, decode_metadata, encode_file_meta, encode_metadata};
use crate::types::{FileMeta, Metadata, MetadataFlag, FDFS_FILE_EXT_NAME_MAX_LEN};

/// Suffix of the metadata companion beside each blob
const META_SUFFIX: &str = "-m";

/// One storage tree root
struct StorePath {
    root: PathBuf,
    used_bytes: AtomicU64,
}

/// The local blob store of one storage server
pub struct FileStore {
    paths: Vec<StorePath>,
    subdir_count: u32,
    capacity_mb: u64,
    advertised_ip: String,
}

impl FileStore {
    /// Opens every configured store path, creating the data roots and
    /// walking existing trees to rebuild the used-space figures
    pub fn open(config: &StorageConfig) -> Result<FileStore> {
        if config.store_paths.is_empty() {
            return Err(FastDFSError::InvalidArgument(
                "no store paths configured".to_string(),
            ));
        }

        let mut paths = Vec::with_capacity(config.store_paths.len());
        for root in &config.store_paths {
            let data_root = root.join("data");
            fs::create_dir_all(&data_root)?;
            let used = walk_size(&data_root)?;
            paths.push(StorePath {
                root: root.clone(),
                used_bytes: AtomicU64::new(used),
            });
        }

        Ok(FileStore {
            paths,
            subdir_count: config.subdir_count_per_path.clamp(1, 256),
            capacity_mb: config.path_capacity_mb,
            advertised_ip: config.advertised_ip.clone(),
        })
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Per-path `(total_mb, free_mb)` for disk usage reports
    pub fn disk_usage(&self) -> Vec<(u64, u64)> {
        self.paths
            .iter()
            .map(|p| {
                let used_mb = p.used_bytes.load(Ordering::Relaxed) / (1024 * 1024);
                (self.capacity_mb, self.capacity_mb.saturating_sub(used_mb))
            })
            .collect()
    }

    pub fn total_mb(&self) -> u64 {
        self.disk_usage().iter().map(|(t, _)| t).sum()
    }

    pub fn free_mb(&self) -> u64 {
        self.disk_usage().iter().map(|(_, f)| f).sum()
    }

    /// Generates a remote filename for a new upload and writes the blob
    ///
    /// The name embeds creator ip, timestamp, size, a random tag and the
    /// crc32, so collisions across the group are negligible and peers can
    /// recover the creation facts from the name alone.
    pub fn store_new(
        &self,
        path_index: u8,
        data: &[u8],
        ext: &str,
        appender: bool,
    ) -> Result<String> {
        if path_index as usize >= self.paths.len() {
            return Err(FastDFSError::InvalidArgument(format!(
                "store path index {} out of range",
                path_index
            )));
        }

        let crc = crc32fast::hash(data);
        let rand_tag: u32 = rand::thread_rng().gen();
        let stem = encode_file_meta(
            &self.advertised_ip,
            crate::types::now_unix(),
            data.len() as u64,
            rand_tag,
            crc,
            appender,
        );
        let remote = self.build_remote_name(path_index, &stem, ext);
        self.write_new(&remote, data, false)?;
        Ok(remote)
    }

    /// Derives and writes a slave file beside its master
    ///
    /// The slave name is the master stem plus the prefix; a slave that
    /// already exists is a conflict, not an overwrite.
    pub fn store_slave(
        &self,
        master_filename: &str,
        prefix: &str,
        ext: &str,
        data: &[u8],
    ) -> Result<String> {
        let remote = build_slave_name(master_filename, prefix, ext)?;
        if self.resolve(&remote)?.exists() {
            return Err(FastDFSError::FileAlreadyExists(remote));
        }
        self.write_new(&remote, data, false)?;
        Ok(remote)
    }

    /// Writes a blob under a caller-supplied name (replication apply)
    ///
    /// Overwrite is explicit: the sync path allows it, client uploads never
    /// reach this entry point.
    pub fn store_at(&self, remote_filename: &str, data: &[u8], overwrite: bool) -> Result<()> {
        self.write_new(remote_filename, data, overwrite)
    }

    fn write_new(&self, remote_filename: &str, data: &[u8], overwrite: bool) -> Result<()> {
        let local = self.resolve(remote_filename)?;
        if !overwrite && local.exists() {
            return Err(FastDFSError::FileAlreadyExists(remote_filename.to_string()));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }

        // Temp-name plus rename keeps partial writes invisible.
        let tmp = tmp_path(&local);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_data()?;
        }
        let replaced = if overwrite {
            fs::metadata(&local).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        fs::rename(&tmp, &local)?;

        let path_index = parse_path_index(remote_filename)?;
        self.adjust_used(path_index, data.len() as i64 - replaced as i64);
        Ok(())
    }

    /// Reads `length` bytes from `offset`; zero length means "to the end"
    pub fn read(&self, remote_filename: &str, offset: u64, length: u64) -> Result<Bytes> {
        let local = self.resolve(remote_filename)?;
        let mut file = fs::File::open(&local)
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;

        let file_size = file.metadata()?.len();
        if offset > file_size {
            return Err(FastDFSError::InvalidArgument(format!(
                "offset {} beyond file size {}",
                offset, file_size
            )));
        }
        let to_read = if length == 0 {
            file_size - offset
        } else {
            length.min(file_size - offset)
        };

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; to_read as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Unlinks a blob and its metadata companion
    pub fn delete(&self, remote_filename: &str) -> Result<()> {
        let local = self.resolve(remote_filename)?;
        let size = fs::metadata(&local)
            .map(|m| m.len())
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;

        fs::remove_file(&local)?;
        let path_index = parse_path_index(remote_filename)?;
        self.adjust_used(path_index, -(size as i64));

        let meta_path = companion_path(&local);
        match fs::remove_file(&meta_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FastDFSError::Io(e)),
        }
        Ok(())
    }

    pub fn exists(&self, remote_filename: &str) -> bool {
        self.resolve(remote_filename)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Applies a metadata change with the merge or overwrite flag
    pub fn set_metadata(
        &self,
        remote_filename: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let local = self.resolve(remote_filename)?;
        if !local.exists() {
            return Err(FastDFSError::FileNotFound(remote_filename.to_string()));
        }

        let merged = match flag {
            MetadataFlag::Overwrite => metadata.clone(),
            MetadataFlag::Merge => {
                let mut existing = self.get_metadata(remote_filename)?;
                for (key, value) in metadata {
                    existing.insert(key.clone(), value.clone());
                }
                existing
            }
        };

        let encoded = encode_metadata(&merged);
        let meta_path = companion_path(&local);
        let tmp = tmp_path(&meta_path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &meta_path)?;
        Ok(())
    }

    /// Raw metadata bytes as stored, for replication forwarding
    pub fn raw_metadata(&self, remote_filename: &str) -> Result<Bytes> {
        let local = self.resolve(remote_filename)?;
        match fs::read(companion_path(&local)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Bytes::new()),
            Err(e) => Err(FastDFSError::Io(e)),
        }
    }

    pub fn get_metadata(&self, remote_filename: &str) -> Result<Metadata> {
        let raw = self.raw_metadata(remote_filename)?;
        decode_metadata(&raw)
    }

    /// Appends to an appender file
    pub fn append(&self, remote_filename: &str, data: &[u8]) -> Result<()> {
        self.require_appender(remote_filename)?;
        let local = self.resolve(remote_filename)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&local)
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;
        file.write_all(data)?;
        file.sync_data()?;

        let path_index = parse_path_index(remote_filename)?;
        self.adjust_used(path_index, data.len() as i64);
        Ok(())
    }

    /// Overwrites a range of an appender file, extending it if needed
    pub fn modify(&self, remote_filename: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.require_appender(remote_filename)?;
        let local = self.resolve(remote_filename)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&local)
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;

        let before = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        let after = file.metadata()?.len();

        let path_index = parse_path_index(remote_filename)?;
        self.adjust_used(path_index, after as i64 - before as i64);
        Ok(())
    }

    /// Truncates an appender file to `new_size`
    pub fn truncate(&self, remote_filename: &str, new_size: u64) -> Result<()> {
        self.require_appender(remote_filename)?;
        let local = self.resolve(remote_filename)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&local)
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;

        let before = file.metadata()?.len();
        file.set_len(new_size)?;
        file.sync_data()?;

        let path_index = parse_path_index(remote_filename)?;
        self.adjust_used(path_index, new_size as i64 - before as i64);
        Ok(())
    }

    /// Creation facts plus the current on-disk size
    pub fn file_info(&self, remote_filename: &str) -> Result<(FileMeta, u64)> {
        let meta = decode_file_meta(remote_filename)?;
        let local = self.resolve(remote_filename)?;
        let size = fs::metadata(&local)
            .map(|m| m.len())
            .map_err(|_| FastDFSError::FileNotFound(remote_filename.to_string()))?;
        Ok((meta, size))
    }

    /// The recorded creation timestamp of a local file, if it exists
    pub fn local_timestamp(&self, remote_filename: &str) -> Option<u64> {
        if !self.exists(remote_filename) {
            return None;
        }
        decode_file_meta(remote_filename)
            .ok()
            .map(|m| m.create_timestamp)
    }

    fn require_appender(&self, remote_filename: &str) -> Result<()> {
        let meta = decode_file_meta(remote_filename)?;
        if !meta.appender {
            return Err(FastDFSError::OperationNotSupported(format!(
                "{} is not an appender file",
                remote_filename
            )));
        }
        Ok(())
    }

    fn build_remote_name(&self, path_index: u8, stem: &str, ext: &str) -> String {
        let hash = crc32fast::hash(stem.as_bytes());
        let d1 = (hash >> 16) % self.subdir_count;
        let d2 = hash % self.subdir_count;
        let ext = normalize_ext(ext);
        if ext.is_empty() {
            format!("M{:02}/{:02x}/{:02x}/{}", path_index, d1, d2, stem)
        } else {
            format!("M{:02}/{:02x}/{:02x}/{}.{}", path_index, d1, d2, stem, ext)
        }
    }

    /// Maps a remote filename to its absolute local path
    pub fn resolve(&self, remote_filename: &str) -> Result<PathBuf> {
        let path_index = parse_path_index(remote_filename)?;
        let store = self
            .paths
            .get(path_index as usize)
            .ok_or_else(|| {
                FastDFSError::InvalidArgument(format!(
                    "store path index {} out of range",
                    path_index
                ))
            })?;

        let rest = &remote_filename[4..];
        if rest.is_empty()
            || rest.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(FastDFSError::InvalidFileId(remote_filename.to_string()));
        }
        Ok(store.root.join("data").join(rest))
    }

    fn adjust_used(&self, path_index: u8, delta: i64) {
        if let Some(store) = self.paths.get(path_index as usize) {
            if delta >= 0 {
                store.used_bytes.fetch_add(delta as u64, Ordering::Relaxed);
            } else {
                store
                    .used_bytes
                    .fetch_sub((-delta) as u64, Ordering::Relaxed);
            }
        }
    }
}

/// Extracts the `Mxx` store-path index prefix
fn parse_path_index(remote_filename: &str) -> Result<u8> {
    let bytes = remote_filename.as_bytes();
    if bytes.len() < 5
        || bytes[0] != b'M'
        || !bytes[1].is_ascii_digit()
        || !bytes[2].is_ascii_digit()
        || bytes[3] != b'/'
    {
        return Err(FastDFSError::InvalidFileId(remote_filename.to_string()));
    }
    Ok((bytes[1] - b'0') * 10 + (bytes[2] - b'0'))
}

fn normalize_ext(ext: &str) -> &str {
    let ext = ext.trim_start_matches('.');
    if ext.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
        &ext[..FDFS_FILE_EXT_NAME_MAX_LEN]
    } else {
        ext
    }
}

/// Derives a slave filename from its master
///
/// The master's extension is dropped, the prefix appended to the stem, and
/// the slave's own extension attached.
pub fn build_slave_name(master_filename: &str, prefix: &str, ext: &str) -> Result<String> {
    if prefix.is_empty() {
        return Err(FastDFSError::InvalidArgument(
            "slave prefix must not be empty".to_string(),
        ));
    }
    let base = match master_filename.rfind('.') {
        // A dot inside the directory part is not an extension.
        Some(pos) if pos > master_filename.rfind('/').map_or(0, |s| s + 1) => {
            &master_filename[..pos]
        }
        _ => master_filename,
    };
    let ext = normalize_ext(ext);
    if ext.is_empty() {
        Ok(format!("{}{}", base, prefix))
    } else {
        Ok(format!("{}{}.{}", base, prefix, ext))
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".tmp");
    target.with_file_name(name)
}

fn companion_path(local: &Path) -> PathBuf {
    let mut name = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(META_SUFFIX);
    local.with_file_name(name)
}

fn walk_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += walk_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store(dir: &Path) -> FileStore {
        let config = StorageConfig::new("group1", "127.0.0.1", 23000)
            .with_store_paths(vec![dir.join("p0"), dir.join("p1")])
            .with_advertised_ip("192.168.1.10");
        FileStore::open(&config).unwrap()
    }

    #[test]
    fn test_store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let remote = store.store_new(0, b"Hello, World!", "txt", false).unwrap();
        assert!(remote.starts_with("M00/"));
        assert!(remote.ends_with(".txt"));

        let data = store.read(&remote, 0, 0).unwrap();
        assert_eq!(&data[..], b"Hello, World!");

        // Range read
        let data = store.read(&remote, 7, 5).unwrap();
        assert_eq!(&data[..], b"World");
    }

    #[test]
    fn test_filename_embeds_creation_facts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let payload = b"payload bytes";
        let remote = store.store_new(1, payload, "bin", false).unwrap();
        assert!(remote.starts_with("M01/"));

        let (meta, size) = store.file_info(&remote).unwrap();
        assert_eq!(meta.source_ip, "192.168.1.10");
        assert_eq!(meta.file_size, payload.len() as u64);
        assert_eq!(meta.crc32, crc32fast::hash(payload));
        assert_eq!(size, payload.len() as u64);
        assert!(!meta.appender);
    }

    #[test]
    fn test_delete_removes_blob_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let remote = store.store_new(0, b"data", "", false).unwrap();
        let mut metadata = HashMap::new();
        metadata.insert("author".to_string(), "Jane".to_string());
        store
            .set_metadata(&remote, &metadata, MetadataFlag::Overwrite)
            .unwrap();

        store.delete(&remote).unwrap();
        assert!(!store.exists(&remote));
        assert!(matches!(
            store.read(&remote, 0, 0),
            Err(FastDFSError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_metadata_merge_vs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let remote = store.store_new(0, b"x", "txt", false).unwrap();

        let mut initial = HashMap::new();
        initial.insert("author".to_string(), "John".to_string());
        initial.insert("year".to_string(), "2025".to_string());
        store
            .set_metadata(&remote, &initial, MetadataFlag::Overwrite)
            .unwrap();

        let mut update = HashMap::new();
        update.insert("author".to_string(), "Jane".to_string());

        store
            .set_metadata(&remote, &update, MetadataFlag::Merge)
            .unwrap();
        let merged = store.get_metadata(&remote).unwrap();
        assert_eq!(merged.get("author"), Some(&"Jane".to_string()));
        assert_eq!(merged.get("year"), Some(&"2025".to_string()));

        store
            .set_metadata(&remote, &update, MetadataFlag::Overwrite)
            .unwrap();
        let overwritten = store.get_metadata(&remote).unwrap();
        assert_eq!(overwritten.len(), 1);
        assert_eq!(overwritten.get("author"), Some(&"Jane".to_string()));
    }

    #[test]
    fn test_appender_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let remote = store.store_new(0, b"start", "log", true).unwrap();
        store.append(&remote, b"-more").unwrap();
        assert_eq!(&store.read(&remote, 0, 0).unwrap()[..], b"start-more");

        store.modify(&remote, 0, b"END__").unwrap();
        assert_eq!(&store.read(&remote, 0, 0).unwrap()[..], b"END__-more");

        store.truncate(&remote, 5).unwrap();
        assert_eq!(&store.read(&remote, 0, 0).unwrap()[..], b"END__");
    }

    #[test]
    fn test_append_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let remote = store.store_new(0, b"fixed", "txt", false).unwrap();
        assert!(matches!(
            store.append(&remote, b"nope"),
            Err(FastDFSError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_slave_name_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let master = store.store_new(0, b"master", "jpg", false).unwrap();

        let slave = store
            .store_slave(&master, "_thumb", "jpg", b"thumb")
            .unwrap();
        assert!(slave.contains("_thumb"));
        assert!(slave.ends_with(".jpg"));
        assert_eq!(&store.read(&slave, 0, 0).unwrap()[..], b"thumb");

        let err = store
            .store_slave(&master, "_thumb", "jpg", b"again")
            .unwrap_err();
        assert!(matches!(err, FastDFSError::FileAlreadyExists(_)));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.resolve("M00/../../etc/passwd").is_err());
        assert!(store.resolve("bogus").is_err());
        assert!(store.resolve("M99/00/00/x").is_err());
    }

    #[test]
    fn test_disk_usage_tracks_writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let free_before = store.free_mb();

        let payload = vec![0u8; 2 * 1024 * 1024];
        let remote = store.store_new(0, &payload, "bin", false).unwrap();
        assert!(store.free_mb() < free_before);

        store.delete(&remote).unwrap();
        assert_eq!(store.free_mb(), free_before);
    }

    #[test]
    fn test_used_space_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let remote;
        {
            let store = store(dir.path());
            remote = store
                .store_new(0, &vec![1u8; 1024 * 1024], "bin", false)
                .unwrap();
        }
        let reopened = store(dir.path());
        assert!(reopened.exists(&remote));
        assert!(reopened.free_mb() < reopened.total_mb());
    }
}
