//! Backup serving and ingestion
//!
//! The leader side creates and verifies backups, then serves the engine's
//! meta file and data files to followers as raw descriptors so the transport
//! can sendfile them. The follower side persists what it receives under
//! `backup_dir` with write-to-tmp-then-rename, parsing the line-oriented
//! meta file:
//!
//! ```text
//! <timestamp>
//! <seq>
//! [metadata<opaque>]        optional
//! <file_count>
//! <rel_path> <crc32>        repeated
//! ```

use crate::engine::Storage;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Parsed meta file. A malformed line terminates parsing; whatever was
/// decoded so far is returned and the caller validates
/// `files.len() == file_count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub timestamp: i64,
    pub seq: u64,
    pub meta_data: Option<String>,
    pub file_count: u64,
    /// (relative path, crc32) pairs
    pub files: Vec<(String, u32)>,
}

impl MetaInfo {
    /// Re-serialize into the line format above
    pub fn to_lines(&self) -> String {
        let mut out = format!("{}\n{}\n", self.timestamp, self.seq);
        if let Some(meta_data) = &self.meta_data {
            out.push_str(meta_data);
            out.push('\n');
        }
        out.push_str(&format!("{}\n", self.file_count));
        for (name, crc32) in &self.files {
            out.push_str(&format!("{} {}\n", name, crc32));
        }
        out
    }
}

/// Create and verify a fresh backup, then open its meta file raw.
/// Returns the open file, the backup id and the file size.
pub fn open_latest_meta(storage: &Storage) -> Result<(File, u32, u64)> {
    storage.create_backup()?;
    let backup_infos = storage.backup_info()?;
    let latest = backup_infos
        .last()
        .ok_or_else(|| Error::NotOk("no backup was found".to_string()))?;
    storage
        .open_backup_engine()?
        .verify_backup(latest.backup_id)
        .map_err(|e| Error::NotOk(e.to_string()))?;

    let meta_file = storage
        .config()
        .backup_dir
        .join("meta")
        .join(latest.backup_id.to_string());
    let size = fs::metadata(&meta_file)?.len();
    let file = File::open(&meta_file)?;
    Ok((file, latest.backup_id, size))
}

/// Open an existing backup data file for zero-copy transmission
pub fn open_data_file(storage: &Storage, rel_path: &str) -> Result<(File, u64)> {
    let abs_path = storage.config().backup_dir.join(rel_path);
    let size = match fs::metadata(&abs_path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!("[storage] data file {:?} not found: {}", abs_path, e);
            return Err(Error::Io(e));
        }
    };
    Ok((File::open(&abs_path)?, size))
}

/// Persist received meta bytes atomically, then parse them
pub fn parse_meta_and_save(storage: &Storage, meta_id: u32, buf: &[u8]) -> Result<MetaInfo> {
    let rel_path = format!("meta/{}", meta_id);
    debug!("[backup] meta id: {}", meta_id);

    let mut tmp = new_tmp_file(storage, &rel_path)?;
    tmp.write_all(buf)?;
    tmp.sync_all()?;
    drop(tmp);

    let meta = parse_meta(buf);
    swap_tmp_file(storage, &rel_path)?;
    Ok(meta)
}

fn parse_meta(buf: &[u8]) -> MetaInfo {
    let mut meta = MetaInfo::default();
    let mut lines = buf
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(line)).into_owned());

    let Some(timestamp) = lines.next().and_then(|l| l.parse().ok()) else {
        return meta;
    };
    meta.timestamp = timestamp;
    debug!("[backup] meta timestamp: {}", meta.timestamp);

    let Some(seq) = lines.next().and_then(|l| l.parse().ok()) else {
        return meta;
    };
    meta.seq = seq;
    debug!("[backup] meta seq: {}", meta.seq);

    let mut line = lines.next();
    if let Some(l) = &line {
        if l.starts_with("metadata") {
            meta.meta_data = Some(l.clone());
            line = lines.next();
        }
    }
    let Some(file_count) = line.and_then(|l| l.parse().ok()) else {
        return meta;
    };
    meta.file_count = file_count;
    debug!("[backup] meta file count: {}", meta.file_count);

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(name), Some(crc32)) = (
            tokens.next(),
            line.split_whitespace().last().and_then(|t| t.parse().ok()),
        ) else {
            break;
        };
        debug!("[backup] meta file: {} {}", name, crc32);
        meta.files.push((name.to_string(), crc32));
    }
    meta
}

/// Create `<rel_path>.tmp` under the backup directory, making parent
/// directories as needed and overwriting a leftover tmp file
pub fn new_tmp_file(storage: &Storage, rel_path: &str) -> Result<File> {
    let tmp_path = tmp_path_of(storage, rel_path);
    if tmp_path.exists() {
        error!("[storage] tmp file {:?} exists, override", tmp_path);
        fs::remove_file(&tmp_path)?;
    }
    if let Some(parent) = tmp_path.parent() {
        mkdir_recursively(parent)?;
    }
    Ok(File::create(&tmp_path)?)
}

/// Atomically promote `<rel_path>.tmp` to `<rel_path>`
pub fn swap_tmp_file(storage: &Storage, rel_path: &str) -> Result<()> {
    let tmp_path = tmp_path_of(storage, rel_path);
    let orig_path = storage.config().backup_dir.join(rel_path);
    fs::rename(&tmp_path, &orig_path)
        .map_err(|_| Error::NotOk(format!("unable to rename: {:?}", tmp_path)))
}

pub fn file_exists(storage: &Storage, rel_path: &str) -> bool {
    storage.config().backup_dir.join(rel_path).exists()
}

/// Remove the whole backup directory
pub fn purge_backup(storage: &Storage) -> Result<()> {
    info!("[storage] purge backup dir");
    rmdir_recursively(&storage.config().backup_dir)
}

fn tmp_path_of(storage: &Storage, rel_path: &str) -> PathBuf {
    storage
        .config()
        .backup_dir
        .join(format!("{}.tmp", rel_path))
}

/// Create each ancestor prefix of `dir` in order
pub fn mkdir_recursively(dir: &Path) -> Result<()> {
    let mut prefix = PathBuf::new();
    for component in dir.components() {
        prefix.push(component);
        if prefix.is_dir() {
            continue;
        }
        if let Err(e) = fs::create_dir(&prefix) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                error!("[storage] failed to create directory recursively: {}", e);
                return Err(Error::NotOk(format!(
                    "failed to create directory {:?}: {}",
                    prefix, e
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first removal. Symlinks are removed, never traversed.
pub fn rmdir_recursively(dir: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
    };
    if !meta.is_dir() {
        return fs::remove_file(dir).map_err(|e| {
            error!("[storage] failed to delete file: {}", e);
            Error::NotOk(format!("failed to delete file {:?}: {}", dir, e))
        });
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let entry_meta = fs::symlink_metadata(&path)?;
        if entry_meta.is_dir() && !entry_meta.file_type().is_symlink() {
            rmdir_recursively(&path)?;
        } else if let Err(e) = fs::remove_file(&path) {
            error!("[storage] failed to delete file: {}", e);
            return Err(Error::NotOk(format!(
                "failed to delete file {:?}: {}",
                path, e
            )));
        }
    }
    fs::remove_dir(dir).map_err(|e| {
        error!("[storage] failed to delete dir: {}", e);
        Error::NotOk(format!("failed to delete dir {:?}: {}", dir, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::test_config;
    use std::io::Read;

    fn open_temp_storage() -> (Storage, String) {
        let dir = format!("/tmp/redrock_backup_test_{}", rand::random::<u64>());
        let storage = Storage::new(test_config(&dir, false));
        storage.open().unwrap();
        (storage, dir)
    }

    fn cleanup(storage: Storage, dir: &str) {
        storage.close();
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_meta_roundtrip() {
        let (storage, dir) = open_temp_storage();
        let meta = MetaInfo {
            timestamp: 1722578400,
            seq: 42,
            meta_data: Some("metadata opaque-blob".to_string()),
            file_count: 2,
            files: vec![
                ("private/1/MANIFEST-000008".to_string(), 1184723444),
                ("shared/000010.sst".to_string(), 2839217),
            ],
        };
        let lines = meta.to_lines();
        let parsed = parse_meta_and_save(&storage, 1, lines.as_bytes()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.to_lines(), lines);
        assert!(file_exists(&storage, "meta/1"));
        assert!(!file_exists(&storage, "meta/1.tmp"));
        cleanup(storage, &dir);
    }

    #[test]
    fn test_meta_without_optional_metadata_line() {
        let (storage, dir) = open_temp_storage();
        let lines = "100\n7\n1\nshared/000001.sst 12345\n";
        let parsed = parse_meta_and_save(&storage, 2, lines.as_bytes()).unwrap();
        assert_eq!(parsed.timestamp, 100);
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.meta_data, None);
        assert_eq!(parsed.file_count, 1);
        assert_eq!(parsed.files, vec![("shared/000001.sst".to_string(), 12345)]);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_meta_accepts_engine_crc32_lines() {
        // the engine writes `<name> crc32 <value>` triples
        let (storage, dir) = open_temp_storage();
        let lines = "100\n7\n1\nshared/000001.sst crc32 12345\n";
        let parsed = parse_meta_and_save(&storage, 3, lines.as_bytes()).unwrap();
        assert_eq!(parsed.files, vec![("shared/000001.sst".to_string(), 12345)]);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_malformed_file_line_returns_partial_result() {
        let (storage, dir) = open_temp_storage();
        let lines = "100\n7\n3\na.sst 1\nbogus-line-without-crc\nc.sst 3\n";
        let parsed = parse_meta_and_save(&storage, 4, lines.as_bytes()).unwrap();
        assert_eq!(parsed.file_count, 3);
        assert_eq!(parsed.files, vec![("a.sst".to_string(), 1)]);
        assert_ne!(parsed.files.len() as u64, parsed.file_count);
        cleanup(storage, &dir);
    }

    #[test]
    fn test_new_tmp_file_overwrites_and_swap_renames() {
        let (storage, dir) = open_temp_storage();
        let mut f = new_tmp_file(&storage, "nested/dir/data.sst").unwrap();
        f.write_all(b"old").unwrap();
        drop(f);
        let mut f = new_tmp_file(&storage, "nested/dir/data.sst").unwrap();
        f.write_all(b"new").unwrap();
        drop(f);
        swap_tmp_file(&storage, "nested/dir/data.sst").unwrap();

        let (mut file, size) = open_data_file(&storage, "nested/dir/data.sst").unwrap();
        assert_eq!(size, 3);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "new");
        cleanup(storage, &dir);
    }

    #[test]
    fn test_open_latest_meta_serves_every_listed_file() {
        let (storage, dir) = open_temp_storage();
        {
            let db = storage.db().unwrap();
            let cf = storage.cf_handle(&db, crate::CF_METADATA).unwrap();
            db.put_cf(cf, b"\x02nsk", b"v").unwrap();
        }
        let (mut file, meta_id, size) = open_latest_meta(&storage).unwrap();
        assert!(meta_id >= 1);
        assert!(size > 0);
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, size);

        let meta = parse_meta_and_save(&storage, meta_id, &buf).unwrap();
        assert_eq!(meta.files.len() as u64, meta.file_count);
        for (name, _) in &meta.files {
            assert!(file_exists(&storage, name), "missing {}", name);
        }
        cleanup(storage, &dir);
    }

    #[test]
    fn test_mkdir_and_rmdir_recursively() {
        let base = PathBuf::from(format!(
            "/tmp/redrock_backup_fs_test_{}",
            rand::random::<u64>()
        ));
        mkdir_recursively(&base.join("a/b/c")).unwrap();
        assert!(base.join("a/b/c").is_dir());
        fs::write(base.join("a/b/file"), b"x").unwrap();
        rmdir_recursively(&base).unwrap();
        assert!(!base.exists());
        // removing a missing directory is fine
        rmdir_recursively(&base).unwrap();
    }

    #[test]
    fn test_purge_backup_removes_directory() {
        let (storage, dir) = open_temp_storage();
        {
            let db = storage.db().unwrap();
            let cf = storage.cf_handle(&db, crate::CF_METADATA).unwrap();
            db.put_cf(cf, b"\x02nsk", b"v").unwrap();
        }
        storage.create_backup().unwrap();
        assert!(storage.config().backup_dir.exists());
        purge_backup(&storage).unwrap();
        assert!(!storage.config().backup_dir.exists());
        cleanup(storage, &dir);
    }
}
