//! Blob 存储：以 Blob id 为文件名的扁平目录。

use futures_util::{Stream, StreamExt};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::atomic::{AtomicFile, TEMP_PREFIX};
use crate::error::DropError;

/// 带名称的 Blob 前缀中十六进制 uuid 的长度。
const ID_PREFIX_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 把 Blob id 映射为路径。id 必须是单个可见的路径分量。
    pub fn resolve(&self, blob_id: &str) -> Result<PathBuf, DropError> {
        if blob_id.is_empty() || blob_id.starts_with(TEMP_PREFIX) {
            return Err(DropError::InvalidBlobId);
        }
        let mut components = Path::new(blob_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) if segment == blob_id => {
                Ok(self.root.join(segment))
            }
            _ => Err(DropError::InvalidBlobId),
        }
    }

    /// 把载荷流式写入隐藏的暂存文件，[`StagedBlob::commit`] 之前 `blob_id` 下不可见。
    /// 载荷一旦超过 `max_bytes` 立即中止。
    pub async fn stage<S, B, E>(
        &self,
        blob_id: String,
        mut body: S,
        max_bytes: u64,
    ) -> Result<StagedBlob, DropError>
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let target = self.resolve(&blob_id)?;
        let mut file = AtomicFile::new(&target).await?;
        let mut size: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    file.cleanup().await;
                    return Err(DropError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        err.to_string(),
                    )));
                }
            };
            let bytes = chunk.as_ref();
            if bytes.is_empty() {
                continue;
            }
            size += bytes.len() as u64;
            if size > max_bytes {
                file.cleanup().await;
                return Err(DropError::UploadTooLarge {
                    received: size,
                    limit: max_bytes,
                });
            }
            if let Err(err) = file.file_mut().write_all(bytes).await {
                file.cleanup().await;
                return Err(err.into());
            }
        }
        Ok(StagedBlob {
            blob_id,
            size,
            file,
        })
    }

    /// 删除 Blob。文件已不存在时返回 `false`。
    pub async fn delete(&self, blob_id: &str) -> Result<bool, DropError> {
        let path = self.resolve(blob_id)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(test)]
    pub async fn exists(&self, blob_id: &str) -> bool {
        match self.resolve(blob_id) {
            Ok(path) => fs::metadata(path)
                .await
                .map(|metadata| metadata.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// 打开 Blob 读取，同时返回其长度。
    pub async fn open(&self, blob_id: &str) -> Result<(File, std::fs::Metadata), DropError> {
        let path = self.resolve(blob_id)?;
        let not_found = |err: io::Error| match err.kind() {
            io::ErrorKind::NotFound => DropError::BlobNotFound(blob_id.to_string()),
            _ => DropError::Io(err),
        };
        let file = File::open(&path).await.map_err(not_found)?;
        let metadata = file.metadata().await.map_err(not_found)?;
        if !metadata.is_file() {
            return Err(DropError::BlobNotFound(blob_id.to_string()));
        }
        Ok((file, metadata))
    }

    /// 所有可见 Blob 的 id，跳过暂存文件。
    pub async fn list_blob_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if entry.metadata().await?.is_file() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// 可见 Blob 在磁盘上的实际字节数。仅用于诊断，记账以账本为准。
    pub async fn scan_usage(&self) -> io::Result<u64> {
        let mut total = 0;
        for id in self.list_blob_ids().await? {
            // 列出后、读取元数据前已被删除
            if let Ok(size) = self.size(&id).await {
                total += size;
            }
        }
        Ok(total)
    }

    /// Blob 在磁盘上的实际长度。
    pub async fn size(&self, blob_id: &str) -> Result<u64, DropError> {
        let path = self.resolve(blob_id)?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => Err(DropError::BlobNotFound(blob_id.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(DropError::BlobNotFound(blob_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 删除中断上传遗留的暂存文件。
    pub async fn cleanup_stale_staging(&self, ttl: Duration) -> io::Result<usize> {
        if ttl.is_zero() {
            return Ok(0);
        }
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(TEMP_PREFIX) || !name.contains(".tmp.") {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = match metadata.modified().ok().and_then(|m| now.duration_since(m).ok()) {
                Some(age) => age,
                None => continue,
            };
            if age >= ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale staging file");
                } else {
                    info!(path = ?path, "removed stale staging file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// 已完整接收、等待准入的载荷。
pub struct StagedBlob {
    blob_id: String,
    size: u64,
    file: AtomicFile,
}

impl StagedBlob {
    pub fn blob_id(&self) -> &str {
        &self.blob_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 让 Blob 以其 id 可见。
    pub async fn commit(self) -> io::Result<String> {
        self.file.finalize().await?;
        Ok(self.blob_id)
    }

    pub async fn discard(self) {
        self.file.cleanup().await;
    }
}

/// 生成 Blob id，保留清理过的客户端文件名。
pub fn new_blob_id(original_name: Option<&str>) -> String {
    let sanitized = original_name.map(sanitize_file_name).filter(|name| !name.is_empty());
    match sanitized {
        Some(name) => format!("{}_{name}", Uuid::new_v4().simple()),
        None => format!("{}.bin", Uuid::new_v4()),
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// 去掉生成的 uuid 前缀后的 Blob id，用于展示。
pub fn display_name(blob_id: &str) -> &str {
    let bytes = blob_id.as_bytes();
    if bytes.len() > ID_PREFIX_LEN
        && bytes[ID_PREFIX_LEN] == b'_'
        && bytes[..ID_PREFIX_LEN]
            .iter()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return &blob_id[ID_PREFIX_LEN + 1..];
    }
    blob_id
}
