//! 客户端键到其上传记录的持久化映射，按时间从旧到新排列。
//!
//! 磁盘上是一份 JSON 文档：
//!
//! ```json
//! {"203.0.113.9": [{"filename": "<blob id>", "size": 1024, "time": 1700000000.25}]}
//! ```
//!
//! 每次修改都先通过临时文件加重命名重写整份文档再返回。写入失败时恢复内存状态，
//! 调用方不会看到未提交的修改。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::write_atomic;
use crate::client::ClientKey;
use crate::error::DropError;

/// 一个已存储的 Blob。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    #[serde(rename = "filename")]
    pub blob_id: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    /// Unix 时间戳，带小数秒。
    #[serde(rename = "time")]
    pub created_at: f64,
}

pub type Buckets = BTreeMap<ClientKey, Vec<UploadRecord>>;

/// 账本载入内存的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerOrigin {
    Loaded,
    Missing,
    /// 文件存在但无法读取或解析。
    Unreadable,
}

#[derive(Clone, Debug)]
pub struct Ledger {
    path: PathBuf,
    buckets: Buckets,
    origin: LedgerOrigin,
}

impl Ledger {
    /// 载入账本，任何失败都退回空账本。
    pub async fn load(path: PathBuf) -> Self {
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "no ledger on disk, starting empty");
                return Self::with_origin(path, Buckets::new(), LedgerOrigin::Missing);
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "ledger unreadable, starting empty");
                return Self::with_origin(path, Buckets::new(), LedgerOrigin::Unreadable);
            }
        };

        match serde_json::from_slice::<Buckets>(&bytes) {
            Ok(buckets) => Self::with_origin(path, buckets, LedgerOrigin::Loaded),
            Err(err) => {
                let backup = corrupt_backup_path(&path);
                warn!(
                    path = ?path,
                    backup = ?backup,
                    error = %err,
                    "ledger corrupt, keeping a copy and starting empty"
                );
                if let Err(err) = fs::copy(&path, &backup).await {
                    warn!(error = %err, "failed to back up corrupt ledger");
                }
                Self::with_origin(path, Buckets::new(), LedgerOrigin::Unreadable)
            }
        }
    }

    #[cfg(test)]
    pub fn empty(path: PathBuf) -> Self {
        Self::with_origin(path, Buckets::new(), LedgerOrigin::Missing)
    }

    fn with_origin(path: PathBuf, buckets: Buckets, origin: LedgerOrigin) -> Self {
        Self {
            path,
            buckets,
            origin,
        }
    }

    pub fn origin(&self) -> LedgerOrigin {
        self.origin
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    /// 把整份文档写入磁盘。
    pub async fn persist(&self) -> Result<(), DropError> {
        let contents = serde_json::to_vec(&self.buckets)
            .map_err(|err| DropError::Persistence(io::Error::other(err)))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(DropError::Persistence)?;
        }
        write_atomic(&self.path, &contents)
            .await
            .map_err(DropError::Persistence)
    }

    async fn persist_or_restore(&mut self, snapshot: Buckets) -> Result<(), DropError> {
        if let Err(err) = self.persist().await {
            self.buckets = snapshot;
            return Err(err);
        }
        Ok(())
    }

    /// 在该键的桶尾追加一条记录并持久化。
    pub async fn append(&mut self, key: &ClientKey, record: UploadRecord) -> Result<(), DropError> {
        let snapshot = self.buckets.clone();
        self.buckets.entry(key.clone()).or_default().push(record);
        self.persist_or_restore(snapshot).await
    }

    /// 删除 `key` 的全部记录并持久化，返回被删除的记录供调用方删除 Blob。
    pub async fn remove_bucket(&mut self, key: &ClientKey) -> Result<Vec<UploadRecord>, DropError> {
        let snapshot = self.buckets.clone();
        let Some(removed) = self.buckets.remove(key) else {
            return Ok(Vec::new());
        };
        self.persist_or_restore(snapshot).await?;
        Ok(removed)
    }

    /// 删除在 `now` 时刻已超过 `max_age` 的记录，并移除因此变空的桶。
    /// 只在有变化时持久化一次。
    pub async fn prune_expired(
        &mut self,
        now: f64,
        max_age: Duration,
    ) -> Result<Vec<(ClientKey, UploadRecord)>, DropError> {
        let max_age = max_age.as_secs_f64();
        self.retain(|record| now - record.created_at <= max_age).await
    }

    /// 调用 [`Ledger::prune_expired`] 是否会产生变化。
    pub fn has_expired(&self, now: f64, max_age: Duration) -> bool {
        let max_age = max_age.as_secs_f64();
        self.buckets.values().any(|records| {
            records.is_empty() || records.iter().any(|r| now - r.created_at > max_age)
        })
    }

    /// 只保留满足 `keep` 的记录；有记录被删除时持久化。
    pub async fn retain<F>(&mut self, mut keep: F) -> Result<Vec<(ClientKey, UploadRecord)>, DropError>
    where
        F: FnMut(&UploadRecord) -> bool,
    {
        let snapshot = self.buckets.clone();
        let mut removed = Vec::new();
        let mut changed = false;
        self.buckets.retain(|key, records| {
            let before = records.len();
            let mut kept = Vec::with_capacity(before);
            for record in records.drain(..) {
                if keep(&record) {
                    kept.push(record);
                } else {
                    removed.push((key.clone(), record));
                }
            }
            *records = kept;
            if records.len() != before {
                changed = true;
            }
            if records.is_empty() {
                changed = true;
                return false;
            }
            true
        });

        if changed {
            self.persist_or_restore(snapshot).await?;
        }
        Ok(removed)
    }

    /// 仅在内存中摘下桶里最旧的 `count` 条记录，由后续的持久化调用提交。
    pub fn take_oldest(&mut self, key: &ClientKey, count: usize) -> Vec<UploadRecord> {
        let Some(records) = self.buckets.get_mut(key) else {
            return Vec::new();
        };
        let count = count.min(records.len());
        let taken: Vec<UploadRecord> = records.drain(..count).collect();
        if records.is_empty() {
            self.buckets.remove(key);
        }
        taken
    }

    pub fn bucket(&self, key: &ClientKey) -> &[UploadRecord] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `key` 记录的字节数；未知的键为零。
    pub fn usage(&self, key: &ClientKey) -> u64 {
        self.bucket(key).iter().map(|record| record.size_bytes).sum()
    }

    /// 所有桶的字节总数。
    pub fn total_usage(&self) -> u64 {
        self.buckets
            .values()
            .flatten()
            .map(|record| record.size_bytes)
            .sum()
    }

    pub fn blob_ids(&self) -> HashSet<&str> {
        self.buckets
            .values()
            .flatten()
            .map(|record| record.blob_id.as_str())
            .collect()
    }

    /// 所有记录及其所属客户端，最新的在前。
    pub fn recent(&self, limit: usize) -> Vec<(ClientKey, UploadRecord)> {
        let mut all: Vec<(ClientKey, UploadRecord)> = self
            .buckets
            .iter()
            .flat_map(|(key, records)| records.iter().map(|r| (key.clone(), r.clone())))
            .collect();
        all.sort_by(|a, b| b.1.created_at.total_cmp(&a.1.created_at));
        all.truncate(limit);
        all
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "ledger".into());
    name.push(".corrupt");
    path.with_file_name(name)
}

/// 当前时间，带小数秒的 Unix 时间戳。
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
