//! Rooted local-directory driver.
//!
//! Writes land in a `.partial` sibling first and are renamed into place so
//! readers never observe a torn file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio_util::io::{ReaderStream, StreamReader};

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, Driver, DriverError, Entry, FsCapabilities, ListOptions,
    Listing, ReadHandle, ShareCapabilities, WriteResult,
};

use crate::util::guess_content_type;

pub struct LocalDriver {
    caps: Capabilities,
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            caps: Capabilities {
                storage_type: "local",
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
            root: root.into(),
        }
    }

    /// Resolve a storage key under the root. Keys are pre-normalized by the
    /// VFS but dot segments are rejected again here; a driver must not trust
    /// its callers with escape hatches.
    fn resolve(&self, key: &str) -> Result<PathBuf, DriverError> {
        let mut path = self.root.clone();
        for part in key.split('/').filter(|v| !v.is_empty()) {
            if part == "." || part == ".." {
                return Err(DriverError::invalid_input(format!(
                    "invalid key segment: {part}"
                )));
            }
            path.push(part);
        }
        Ok(path)
    }

    fn entry_from_meta(key: &str, name: &str, meta: &std::fs::Metadata) -> Entry {
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        Entry {
            name: name.to_string(),
            key: key.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified_ms,
            is_directory: meta.is_dir(),
            etag: None,
            content_type: if meta.is_dir() {
                None
            } else {
                Some(guess_content_type(name))
            },
        }
    }
}

fn io_error(err: std::io::Error, context: &str) -> DriverError {
    match err.kind() {
        std::io::ErrorKind::NotFound => DriverError::not_found(format!("{context}: not found")),
        std::io::ErrorKind::PermissionDenied => {
            DriverError::permission_denied(format!("{context}: permission denied"))
        }
        std::io::ErrorKind::AlreadyExists => {
            DriverError::conflict(format!("{context}: already exists"))
        }
        _ => DriverError::internal(format!("{context}: {err}")),
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, _opts: &ListOptions) -> Result<Listing, DriverError> {
        let dir = self.resolve(key)?;
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(e, "list"))?;

        let mut entries = Vec::new();
        while let Some(item) = read_dir.next_entry().await.map_err(|e| io_error(e, "list"))? {
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = match item.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let child_key = if key.is_empty() {
                name.clone()
            } else {
                format!("{key}/{name}")
            };
            entries.push(Self::entry_from_meta(&child_key, &name, &meta));
        }

        Ok(Listing {
            entries,
            truncated: false,
            next_cursor: None,
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let name = key.rsplit('/').next().unwrap_or(key);
                Ok(Some(Self::entry_from_meta(key, name, &meta)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err, "stat")),
        }
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let path = self.resolve(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(e, "read"))?;
        let meta = file.metadata().await.map_err(|e| io_error(e, "read"))?;
        if meta.is_dir() {
            return Err(DriverError::invalid_input("cannot read a directory"));
        }
        let total = meta.len();
        let content_type = guess_content_type(key.rsplit('/').next().unwrap_or(key));

        match range {
            None => Ok(ReadHandle {
                stream: Box::pin(ReaderStream::new(file)),
                content_type,
                size: total,
                total_size: total,
                etag: None,
                content_range: None,
            }),
            Some(range) => {
                if range.start >= total {
                    return Err(DriverError::invalid_input("range start beyond file size"));
                }
                let end = range.end.map_or(total - 1, |e| e.min(total - 1));
                let len = end - range.start + 1;
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| io_error(e, "read"))?;
                Ok(ReadHandle {
                    stream: Box::pin(ReaderStream::new(file.take(len))),
                    content_type,
                    size: len,
                    total_size: total,
                    etag: None,
                    content_range: Some(format!("bytes {}-{end}/{total}", range.start)),
                })
            }
        }
    }

    async fn write(
        &self,
        key: &str,
        body: ByteStream,
        _size: u64,
        _content_type: &str,
    ) -> Result<WriteResult, DriverError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, "write"))?;
        }
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(DriverError::conflict("a directory exists at this key"));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriverError::invalid_input("invalid file name"))?;
        let tmp = path.with_file_name(format!("{file_name}.partial"));
        let _ = tokio::fs::remove_file(&tmp).await;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(e, "write"))?;
        let mut reader = StreamReader::new(body);
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| io_error(e, "write"))?;
        file.flush().await.map_err(|e| io_error(e, "write"))?;
        drop(file);

        let _ = tokio::fs::remove_file(&path).await;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(e, "write"))?;
        Ok(WriteResult::default())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), DriverError> {
        let path = self.resolve(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, "delete"))?;
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| io_error(e, "delete"))?;
            } else {
                tokio::fs::remove_dir(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::DirectoryNotEmpty {
                        DriverError::conflict("directory not empty")
                    } else {
                        io_error(e, "delete")
                    }
                })?;
            }
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_error(e, "delete"))?;
        }
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> Result<(), DriverError> {
        let path = self.resolve(key)?;
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            return Err(DriverError::conflict("a file exists at this key"));
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error(e, "mkdir"))
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, "rename"))?;
        }
        tokio::fs::rename(&src_path, &dst_path)
            .await
            .map_err(|e| io_error(e, "rename"))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        copy_recursive(&src_path, &dst_path).await
    }
}

async fn copy_recursive(src: &Path, dst: &Path) -> Result<(), DriverError> {
    let meta = tokio::fs::metadata(src)
        .await
        .map_err(|e| io_error(e, "copy"))?;
    if meta.is_file() {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, "copy"))?;
        }
        tokio::fs::copy(src, dst)
            .await
            .map_err(|e| io_error(e, "copy"))?;
        return Ok(());
    }

    tokio::fs::create_dir_all(dst)
        .await
        .map_err(|e| io_error(e, "copy"))?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        let mut read_dir = tokio::fs::read_dir(&from)
            .await
            .map_err(|e| io_error(e, "copy"))?;
        while let Some(item) = read_dir.next_entry().await.map_err(|e| io_error(e, "copy"))? {
            let target = to.join(item.file_name());
            let meta = item.metadata().await.map_err(|e| io_error(e, "copy"))?;
            if meta.is_dir() {
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| io_error(e, "copy"))?;
                stack.push((item.path(), target));
            } else {
                tokio::fs::copy(item.path(), &target)
                    .await
                    .map_err(|e| io_error(e, "copy"))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt as _;
    use tempfile::TempDir;

    use portico_driver_api::{ByteRange, Driver, ErrorKind, ListOptions};

    use crate::util::stream_from_bytes;

    use super::LocalDriver;

    async fn read_all(driver: &LocalDriver, key: &str, range: Option<ByteRange>) -> Vec<u8> {
        let handle = driver.read(key, range).await.unwrap();
        let mut out = Vec::new();
        let mut stream = handle.stream;
        while let Some(chunk) = stream.try_next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn write_then_read_with_range() {
        let temp = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp.path());

        driver
            .write("a/b.txt", stream_from_bytes(b"0123456789".to_vec()), 10, "")
            .await
            .unwrap();

        assert_eq!(read_all(&driver, "a/b.txt", None).await, b"0123456789");
        let partial = read_all(
            &driver,
            "a/b.txt",
            Some(ByteRange {
                start: 3,
                end: Some(5),
            }),
        )
        .await;
        assert_eq!(partial, b"345");
    }

    #[tokio::test]
    async fn resolve_rejects_dot_segments() {
        let temp = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp.path());
        let err = driver.stat("../escape").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn list_and_delete() {
        let temp = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp.path());
        driver.mkdir("docs").await.unwrap();
        driver
            .write("docs/x.txt", stream_from_bytes(b"x".to_vec()), 1, "")
            .await
            .unwrap();

        let listing = driver.list("docs", &ListOptions::default()).await.unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "x.txt");

        let err = driver.delete("docs", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        driver.delete("docs", true).await.unwrap();
        assert!(driver.stat("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp.path());
        driver
            .write("f.bin", stream_from_bytes(vec![0u8; 64]), 64, "")
            .await
            .unwrap();
        assert!(!temp.path().join("f.bin.partial").exists());
        assert!(temp.path().join("f.bin").exists());
    }
}
