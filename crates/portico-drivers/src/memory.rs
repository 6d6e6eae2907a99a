//! In-process tree driver.
//!
//! Backs scratch mounts and most engine/VFS tests. Objects live in a
//! `BTreeMap` keyed by storage key, so prefix scans are ordered for free.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, Driver, DriverError, Entry, FsCapabilities, ListOptions,
    Listing, ReadHandle, ShareCapabilities, WriteResult,
};

use crate::util::{collect_stream, guess_content_type, now_ms, stream_from_bytes};

#[derive(Debug, Clone)]
struct MemObject {
    data: Vec<u8>,
    content_type: String,
    modified_ms: i64,
    etag: String,
}

#[derive(Debug, Default)]
struct MemTree {
    objects: BTreeMap<String, MemObject>,
    dirs: BTreeSet<String>,
}

pub struct MemoryDriver {
    caps: Capabilities,
    tree: Arc<Mutex<MemTree>>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                storage_type: "memory",
                remote: false,
                fs: FsCapabilities {
                    backend_stream: true,
                    backend_form: true,
                    list: true,
                    stat: true,
                    read: true,
                    range: true,
                    write: true,
                    delete: true,
                    rename: true,
                    copy: true,
                    mkdir: true,
                    ..Default::default()
                },
                share: ShareCapabilities {
                    backend_stream: true,
                    backend_form: true,
                    ..Default::default()
                },
                multipart: None,
                sha256_required_for_presign: false,
            },
            tree: Arc::new(Mutex::new(MemTree::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemTree> {
        self.tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry_for(key: &str, obj: &MemObject) -> Entry {
        Entry {
            name: key.rsplit('/').next().unwrap_or(key).to_string(),
            key: key.to_string(),
            size: obj.data.len() as u64,
            modified_ms: Some(obj.modified_ms),
            is_directory: false,
            etag: Some(obj.etag.clone()),
            content_type: Some(obj.content_type.clone()),
        }
    }

    fn dir_entry(key: &str) -> Entry {
        Entry {
            name: key.rsplit('/').next().unwrap_or(key).to_string(),
            key: key.to_string(),
            size: 0,
            modified_ms: None,
            is_directory: true,
            etag: None,
            content_type: None,
        }
    }

    fn has_dir(tree: &MemTree, key: &str) -> bool {
        if key.is_empty() {
            return true;
        }
        if tree.dirs.contains(key) {
            return true;
        }
        let prefix = format!("{key}/");
        tree.objects.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix))
            || tree
                .dirs
                .range(prefix.clone()..)
                .next()
                .is_some_and(|k| k.starts_with(&prefix))
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = String::with_capacity(16);
    for b in digest.iter().take(8) {
        hex.push_str(&format!("{b:02x}"));
    }
    format!("\"{hex}\"")
}

#[async_trait]
impl Driver for MemoryDriver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, _opts: &ListOptions) -> Result<Listing, DriverError> {
        let tree = self.lock();
        if !Self::has_dir(&tree, key) {
            return Err(DriverError::not_found(format!("no such directory: {key}")));
        }

        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let mut names = BTreeSet::<String>::new();
        let mut entries = Vec::new();

        for dir in tree.dirs.iter().filter(|d| d.starts_with(&prefix)) {
            let rest = &dir[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                    names.insert(format!("{prefix}{child}"));
                }
                continue;
            }
            names.insert(dir.clone());
        }
        for obj_key in tree.objects.keys().filter(|k| k.starts_with(&prefix)) {
            let rest = &obj_key[prefix.len()..];
            if rest.contains('/') {
                if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                    names.insert(format!("{prefix}{child}"));
                }
            }
        }

        for name in names {
            if tree.objects.contains_key(&name) {
                continue;
            }
            entries.push(Self::dir_entry(&name));
        }
        for (obj_key, obj) in tree.objects.range(prefix.clone()..) {
            if !obj_key.starts_with(&prefix) {
                break;
            }
            if obj_key[prefix.len()..].contains('/') {
                continue;
            }
            entries.push(Self::entry_for(obj_key, obj));
        }

        Ok(Listing {
            entries,
            truncated: false,
            next_cursor: None,
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let tree = self.lock();
        if let Some(obj) = tree.objects.get(key) {
            return Ok(Some(Self::entry_for(key, obj)));
        }
        if Self::has_dir(&tree, key) {
            return Ok(Some(Self::dir_entry(key)));
        }
        Ok(None)
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let (data, content_type, etag, total) = {
            let tree = self.lock();
            let obj = tree
                .objects
                .get(key)
                .ok_or_else(|| DriverError::not_found(format!("no such object: {key}")))?;
            (
                obj.data.clone(),
                obj.content_type.clone(),
                obj.etag.clone(),
                obj.data.len() as u64,
            )
        };

        let (slice, content_range) = match range {
            None => (data, None),
            Some(range) => {
                if range.start >= total {
                    return Err(DriverError::invalid_input("range start beyond object size"));
                }
                let end = range.end.map_or(total - 1, |e| e.min(total - 1));
                let slice = data[range.start as usize..=end as usize].to_vec();
                (
                    slice,
                    Some(format!("bytes {}-{}/{}", range.start, end, total)),
                )
            }
        };

        Ok(ReadHandle {
            size: slice.len() as u64,
            total_size: total,
            stream: stream_from_bytes(slice),
            content_type,
            etag: Some(etag),
            content_range,
        })
    }

    async fn write(
        &self,
        key: &str,
        body: ByteStream,
        _size: u64,
        content_type: &str,
    ) -> Result<WriteResult, DriverError> {
        if key.is_empty() {
            return Err(DriverError::invalid_input("cannot write the root"));
        }
        let data = collect_stream(body).await?;
        let etag = etag_of(&data);

        let mut tree = self.lock();
        if tree.dirs.contains(key) {
            return Err(DriverError::conflict(format!(
                "a directory exists at {key}"
            )));
        }
        let content_type = if content_type.is_empty() {
            guess_content_type(key)
        } else {
            content_type.to_string()
        };
        tree.objects.insert(
            key.to_string(),
            MemObject {
                data,
                content_type,
                modified_ms: now_ms(),
                etag: etag.clone(),
            },
        );
        Ok(WriteResult { etag: Some(etag) })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), DriverError> {
        let mut tree = self.lock();
        if tree.objects.remove(key).is_some() {
            return Ok(());
        }

        if !Self::has_dir(&tree, key) {
            return Err(DriverError::not_found(format!("no such path: {key}")));
        }
        let prefix = format!("{key}/");
        let has_children = tree
            .objects
            .keys()
            .any(|k| k.starts_with(&prefix))
            || tree.dirs.iter().any(|d| d.starts_with(&prefix));
        if has_children && !recursive {
            return Err(DriverError::conflict(format!("directory not empty: {key}")));
        }
        tree.objects.retain(|k, _| !k.starts_with(&prefix));
        tree.dirs.retain(|d| d != key && !d.starts_with(&prefix));
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> Result<(), DriverError> {
        let mut tree = self.lock();
        if tree.objects.contains_key(key) {
            return Err(DriverError::conflict(format!("a file exists at {key}")));
        }
        tree.dirs.insert(key.to_string());
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let mut tree = self.lock();
        if let Some(obj) = tree.objects.remove(src) {
            tree.objects.insert(dst.to_string(), obj);
            return Ok(());
        }
        if !Self::has_dir(&tree, src) {
            return Err(DriverError::not_found(format!("no such path: {src}")));
        }

        let src_prefix = format!("{src}/");
        let moved: Vec<(String, MemObject)> = tree
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(&src_prefix))
            .map(|(k, v)| (format!("{dst}/{}", &k[src_prefix.len()..]), v.clone()))
            .collect();
        tree.objects.retain(|k, _| !k.starts_with(&src_prefix));
        tree.objects.extend(moved);

        let moved_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|d| d.starts_with(&src_prefix))
            .map(|d| format!("{dst}/{}", &d[src_prefix.len()..]))
            .collect();
        tree.dirs.retain(|d| d != src && !d.starts_with(&src_prefix));
        tree.dirs.insert(dst.to_string());
        tree.dirs.extend(moved_dirs);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let mut tree = self.lock();
        if let Some(obj) = tree.objects.get(src).cloned() {
            tree.objects.insert(dst.to_string(), obj);
            return Ok(());
        }
        if !Self::has_dir(&tree, src) {
            return Err(DriverError::not_found(format!("no such path: {src}")));
        }

        let src_prefix = format!("{src}/");
        let copied: Vec<(String, MemObject)> = tree
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(&src_prefix))
            .map(|(k, v)| (format!("{dst}/{}", &k[src_prefix.len()..]), v.clone()))
            .collect();
        tree.objects.extend(copied);
        tree.dirs.insert(dst.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use portico_driver_api::{ByteRange, Driver, ErrorKind, ListOptions};

    use crate::util::stream_from_bytes;

    use super::MemoryDriver;

    async fn put(driver: &MemoryDriver, key: &str, data: &[u8]) {
        driver
            .write(key, stream_from_bytes(data.to_vec()), data.len() as u64, "")
            .await
            .unwrap();
    }

    async fn read_all(driver: &MemoryDriver, key: &str, range: Option<ByteRange>) -> Vec<u8> {
        use futures_util::TryStreamExt as _;
        let handle = driver.read(key, range).await.unwrap();
        let mut out = Vec::new();
        let mut stream = handle.stream;
        while let Some(chunk) = stream.try_next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn write_stat_read_round_trip() {
        let driver = MemoryDriver::new();
        put(&driver, "docs/a.txt", b"hello").await;

        let entry = driver.stat("docs/a.txt").await.unwrap().unwrap();
        assert_eq!(entry.size, 5);
        assert!(!entry.is_directory);

        assert_eq!(read_all(&driver, "docs/a.txt", None).await, b"hello");
    }

    #[tokio::test]
    async fn range_read_returns_slice_and_content_range() {
        let driver = MemoryDriver::new();
        put(&driver, "a.bin", b"0123456789").await;

        let handle = driver
            .read(
                "a.bin",
                Some(ByteRange {
                    start: 2,
                    end: Some(4),
                }),
            )
            .await
            .unwrap();
        assert_eq!(handle.content_range.as_deref(), Some("bytes 2-4/10"));
        assert_eq!(handle.size, 3);
    }

    #[tokio::test]
    async fn list_shows_implicit_directories() {
        let driver = MemoryDriver::new();
        put(&driver, "docs/sub/a.txt", b"x").await;
        put(&driver, "docs/b.txt", b"y").await;

        let listing = driver.list("docs", &ListOptions::default()).await.unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"sub"));
        assert!(names.contains(&"b.txt"));
    }

    #[tokio::test]
    async fn delete_directory_requires_recursive() {
        let driver = MemoryDriver::new();
        put(&driver, "d/a", b"x").await;

        let err = driver.delete("d", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        driver.delete("d", true).await.unwrap();
        assert!(driver.stat("d/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rename_moves_subtree() {
        let driver = MemoryDriver::new();
        put(&driver, "src/a", b"1").await;
        put(&driver, "src/deep/b", b"2").await;

        driver.rename("src", "dst").await.unwrap();
        assert!(driver.stat("src/a").await.unwrap().is_none());
        assert_eq!(read_all(&driver, "dst/a", None).await, b"1");
        assert_eq!(read_all(&driver, "dst/deep/b", None).await, b"2");
    }
}
