//! 访问协调：账本的每次修改与对应的 Blob 写入、删除串行执行。
//!
//! 账本放在一把 `RwLock` 后面。提交、清空、过期清理与启动对账在整个
//! 准入、写入、持久化过程中持有写锁；用量查询共享读锁，看到的总是已提交的账本。

use std::fs::Metadata;
use std::time::Duration;
use tokio::fs::File;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time;
use tracing::{info, warn};

use crate::client::ClientKey;
use crate::error::DropError;
use crate::ledger::{Ledger, UploadRecord, unix_now};
use crate::quota::{self, Decision, Limits};
use crate::storage::{BlobStore, StagedBlob};
use crate::sweeper::{self, ReconcileReport, SweepReport, delete_blob_quietly};

/// 上传提交结果。
#[derive(Clone, Debug)]
pub struct Receipt {
    pub record: UploadRecord,
    pub evicted: Vec<UploadRecord>,
    pub client_usage: u64,
    pub global_usage: u64,
}

/// 单个客户端的用量摘要。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientUsage {
    pub files: usize,
    pub used_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug)]
pub struct Coordinator {
    ledger: RwLock<Ledger>,
    blobs: BlobStore,
    limits: Limits,
    lock_timeout: Duration,
}

impl Coordinator {
    pub fn new(ledger: Ledger, blobs: BlobStore, limits: Limits, lock_timeout: Duration) -> Self {
        Self {
            ledger: RwLock::new(ledger),
            blobs,
            limits,
            lock_timeout,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, Ledger>, DropError> {
        time::timeout(self.lock_timeout, self.ledger.write())
            .await
            .map_err(|_| DropError::Busy)
    }

    async fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().await
    }

    /// 基于当前账本的预检。最终判定在 [`Coordinator::commit_upload`] 中重新执行。
    pub async fn admit_upload(&self, key: &ClientKey, size: u64) -> Decision {
        let ledger = self.read().await;
        quota::admit(&ledger, &self.limits, key, size)
    }

    /// 准入已完整接收的上传，策略允许时驱逐客户端最旧的文件，然后发布 Blob 并记账。
    pub async fn commit_upload(
        &self,
        key: &ClientKey,
        staged: StagedBlob,
    ) -> Result<Receipt, DropError> {
        self.commit_upload_at(key, staged, unix_now()).await
    }

    pub(crate) async fn commit_upload_at(
        &self,
        key: &ClientKey,
        staged: StagedBlob,
        now: f64,
    ) -> Result<Receipt, DropError> {
        let mut ledger = match self.write().await {
            Ok(ledger) => ledger,
            Err(err) => {
                staged.discard().await;
                return Err(err);
            }
        };
        let size = staged.size();

        let evict = match quota::admit(&ledger, &self.limits, key, size) {
            Decision::Accept { evict, .. } => evict,
            Decision::Reject(reason) => {
                info!(
                    client = %key,
                    blob_id = staged.blob_id(),
                    size,
                    reason = ?reason,
                    "upload rejected"
                );
                staged.discard().await;
                return Err(reason.into());
            }
        };

        let snapshot = ledger.clone();
        let evicted = ledger.take_oldest(key, evict);
        let blob_id = match staged.commit().await {
            Ok(blob_id) => blob_id,
            Err(err) => {
                *ledger = snapshot;
                return Err(err.into());
            }
        };

        let record = UploadRecord {
            blob_id,
            size_bytes: size,
            created_at: now,
        };
        if let Err(err) = ledger.append(key, record.clone()).await {
            *ledger = snapshot;
            delete_blob_quietly(&self.blobs, &record.blob_id, "uncommitted").await;
            return Err(err);
        }

        for victim in &evicted {
            info!(
                client = %key,
                blob_id = victim.blob_id,
                size = victim.size_bytes,
                "evicted to make room"
            );
            delete_blob_quietly(&self.blobs, &victim.blob_id, "evicted").await;
        }

        let receipt = Receipt {
            client_usage: ledger.usage(key),
            global_usage: ledger.total_usage(),
            record,
            evicted,
        };
        info!(
            client = %key,
            blob_id = receipt.record.blob_id,
            size,
            evicted = receipt.evicted.len(),
            "upload committed"
        );
        Ok(receipt)
    }

    /// 删除 `key` 的全部上传，返回释放的字节数。
    pub async fn clear(&self, key: &ClientKey) -> Result<u64, DropError> {
        let mut ledger = self.write().await?;
        let removed = ledger.remove_bucket(key).await?;
        let mut freed = 0;
        for record in &removed {
            delete_blob_quietly(&self.blobs, &record.blob_id, "cleared").await;
            freed += record.size_bytes;
        }
        info!(client = %key, files = removed.len(), freed, "cleared uploads");
        Ok(freed)
    }

    pub async fn current_global_usage(&self) -> u64 {
        self.read().await.total_usage()
    }

    pub async fn current_client_usage(&self, key: &ClientKey) -> u64 {
        self.read().await.usage(key)
    }

    pub async fn client_summary(&self, key: &ClientKey) -> ClientUsage {
        let ledger = self.read().await;
        let used_bytes = ledger.usage(key);
        ClientUsage {
            files: ledger.bucket(key).len(),
            used_bytes,
            remaining_bytes: self.limits.client_cap_bytes.saturating_sub(used_bytes),
        }
    }

    /// 所有上传及其所属客户端，最新的在前。
    pub async fn list_recent(&self, limit: usize) -> Vec<(ClientKey, UploadRecord)> {
        self.read().await.recent(limit)
    }

    /// 打开 Blob 供下载。持有读锁，避免并发的清空在查找与打开之间删除文件。
    pub async fn open_blob(&self, blob_id: &str) -> Result<(File, Metadata), DropError> {
        let _ledger = self.read().await;
        self.blobs.open(blob_id).await
    }

    /// 清理超过最大保存时长的上传。
    pub async fn sweep(&self) -> Result<SweepReport, DropError> {
        self.sweep_at(unix_now()).await
    }

    pub(crate) async fn sweep_at(&self, now: f64) -> Result<SweepReport, DropError> {
        if !self.read().await.has_expired(now, self.limits.max_age) {
            return Ok(SweepReport::default());
        }
        let mut ledger = self.write().await?;
        sweeper::sweep_expired(&mut ledger, &self.blobs, now, self.limits.max_age).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, DropError> {
        let mut ledger = self.write().await?;
        let report = sweeper::reconcile(&mut ledger, &self.blobs).await?;
        if report != ReconcileReport::default() {
            warn!(
                dangling_records = report.dangling_records,
                orphan_blobs = report.orphan_blobs,
                "ledger and blob store reconciled"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{OverflowPolicy, RejectReason};
    use futures_util::stream;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make(policy: OverflowPolicy, global: u64, client: u64) -> (tempfile::TempDir, Coordinator) {
        let temp = tempdir().expect("tempdir");
        let blobs = BlobStore::new(temp.path().join("blobs"));
        std::fs::create_dir_all(blobs.root_path()).expect("create blobs");
        let ledger = Ledger::empty(temp.path().join("files.json"));
        let limits = Limits {
            global_cap_bytes: global,
            client_cap_bytes: client,
            max_age: Duration::from_secs(3600),
            policy,
        };
        (
            temp,
            Coordinator::new(ledger, blobs, limits, Duration::from_secs(5)),
        )
    }

    async fn stage(coordinator: &Coordinator, id: &str, size: usize) -> StagedBlob {
        let payload = vec![7u8; size];
        coordinator
            .blobs()
            .stage(
                id.to_string(),
                stream::iter(vec![Ok::<_, std::io::Error>(payload)]),
                u64::MAX,
            )
            .await
            .expect("stage")
    }

    async fn upload(
        coordinator: &Coordinator,
        key: &str,
        id: &str,
        size: usize,
        at: f64,
    ) -> Result<Receipt, DropError> {
        let staged = stage(coordinator, id, size).await;
        coordinator
            .commit_upload_at(&ClientKey::new(key), staged, at)
            .await
    }

    #[tokio::test]
    async fn usage_tracks_every_admitted_upload() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 1000, 100);
        let key = ClientKey::new("a");
        let mut expected = 0;
        for (i, size) in [10usize, 25, 40].into_iter().enumerate() {
            upload(&coordinator, "a", &format!("{i}.bin"), size, i as f64)
                .await
                .expect("upload");
            expected += size as u64;
            assert_eq!(coordinator.current_client_usage(&key).await, expected);
        }
        assert_eq!(coordinator.current_global_usage().await, expected);
        assert_eq!(coordinator.blobs().scan_usage().await.expect("scan"), expected);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_and_deletes_their_blobs() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 1000, 100);
        upload(&coordinator, "a", "r1.bin", 60, 1.0).await.expect("r1");
        upload(&coordinator, "a", "r2.bin", 30, 2.0).await.expect("r2");

        let receipt = upload(&coordinator, "a", "r3.bin", 60, 3.0).await.expect("r3");
        let evicted: Vec<&str> = receipt.evicted.iter().map(|r| r.blob_id.as_str()).collect();
        assert_eq!(evicted, vec!["r1.bin"]);
        assert_eq!(receipt.client_usage, 90);
        assert!(!coordinator.blobs().exists("r1.bin").await);
        assert!(coordinator.blobs().exists("r2.bin").await);
        assert!(coordinator.blobs().exists("r3.bin").await);
    }

    #[tokio::test]
    async fn reject_mode_leaves_bucket_and_disk_untouched() {
        let (temp, coordinator) = make(OverflowPolicy::Reject, 1000, 100);
        upload(&coordinator, "b", "keep.bin", 80, 1.0).await.expect("first");

        let result = upload(&coordinator, "b", "big.bin", 30, 2.0).await;
        assert!(matches!(result, Err(DropError::PerClientCapExceeded { .. })));
        assert_eq!(coordinator.current_client_usage(&ClientKey::new("b")).await, 80);
        assert_eq!(coordinator.blobs().list_blob_ids().await.expect("list"), vec!["keep.bin"]);
        let entries = std::fs::read_dir(temp.path().join("blobs")).expect("read").count();
        assert_eq!(entries, 1, "staging file must be discarded");
    }

    #[tokio::test]
    async fn global_cap_rejects_without_touching_anything() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 100, 100);
        upload(&coordinator, "a", "a.bin", 70, 1.0).await.expect("a");

        let result = upload(&coordinator, "b", "b.bin", 40, 2.0).await;
        assert!(matches!(
            result,
            Err(DropError::InsufficientSpace {
                requested: 40,
                available: 30
            })
        ));
        assert_eq!(coordinator.current_global_usage().await, 70);
        assert!(!coordinator.blobs().exists("b.bin").await);
        assert_eq!(
            coordinator.admit_upload(&ClientKey::new("b"), 30).await,
            Decision::Accept {
                evict: 0,
                evicted_bytes: 0
            }
        );
        assert_eq!(
            coordinator.admit_upload(&ClientKey::new("b"), 31).await,
            Decision::Reject(RejectReason::InsufficientSpace {
                requested: 31,
                available: 30
            })
        );
    }

    #[tokio::test]
    async fn upload_larger_than_client_cap_drains_the_bucket() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 1000, 100);
        upload(&coordinator, "a", "old.bin", 50, 1.0).await.expect("old");

        let receipt = upload(&coordinator, "a", "big.bin", 150, 2.0)
            .await
            .expect("big");
        assert_eq!(receipt.evicted.len(), 1);
        assert_eq!(receipt.client_usage, 150);
        assert!(!coordinator.blobs().exists("old.bin").await);
        assert_eq!(coordinator.blobs().list_blob_ids().await.expect("list"), vec!["big.bin"]);
    }

    #[tokio::test]
    async fn eviction_frees_room_under_the_global_cap() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 100, 60);
        upload(&coordinator, "a", "a.bin", 60, 1.0).await.expect("a");
        upload(&coordinator, "b", "b.bin", 30, 2.0).await.expect("b");

        let receipt = upload(&coordinator, "a", "next.bin", 20, 3.0)
            .await
            .expect("next");
        assert_eq!(receipt.evicted.len(), 1);
        assert_eq!(receipt.global_usage, 50);
        assert!(!coordinator.blobs().exists("a.bin").await);
        assert!(coordinator.blobs().exists("b.bin").await);
    }

    #[tokio::test]
    async fn clear_frees_bucket_and_blobs() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 1000, 100);
        upload(&coordinator, "a", "1.bin", 10, 1.0).await.expect("1");
        upload(&coordinator, "a", "2.bin", 15, 2.0).await.expect("2");
        upload(&coordinator, "b", "3.bin", 5, 3.0).await.expect("3");
        std::fs::remove_file(coordinator.blobs().root_path().join("2.bin")).expect("remove");

        let freed = coordinator.clear(&ClientKey::new("a")).await.expect("clear");
        assert_eq!(freed, 25);
        assert_eq!(coordinator.current_client_usage(&ClientKey::new("a")).await, 0);
        assert_eq!(coordinator.blobs().list_blob_ids().await.expect("list"), vec!["3.bin"]);
        assert_eq!(coordinator.clear(&ClientKey::new("a")).await.expect("again"), 0);
    }

    #[tokio::test]
    async fn sweep_expires_by_age() {
        let (_temp, coordinator) = make(OverflowPolicy::Evict, 1000, 100);
        upload(&coordinator, "a", "t0.bin", 10, 0.0).await.expect("upload");

        assert_eq!(coordinator.sweep_at(3599.0).await.expect("sweep").removed, 0);
        assert!(coordinator.blobs().exists("t0.bin").await);
        assert_eq!(coordinator.sweep_at(3601.0).await.expect("sweep").removed, 1);
        assert!(!coordinator.blobs().exists("t0.bin").await);
        assert!(coordinator.list_recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn failed_persist_discards_the_new_blob() {
        let temp = tempdir().expect("tempdir");
        let blobs = BlobStore::new(temp.path().join("blobs"));
        std::fs::create_dir_all(blobs.root_path()).expect("create blobs");
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, b"x").expect("write");
        let coordinator = Coordinator::new(
            Ledger::empty(blocker.join("files.json")),
            blobs,
            Limits {
                global_cap_bytes: 1000,
                client_cap_bytes: 100,
                max_age: Duration::from_secs(60),
                policy: OverflowPolicy::Evict,
            },
            Duration::from_secs(5),
        );

        let result = upload(&coordinator, "a", "new.bin", 10, 1.0).await;
        assert!(matches!(result, Err(DropError::Persistence(_))));
        assert!(!coordinator.blobs().exists("new.bin").await);
        assert_eq!(coordinator.current_client_usage(&ClientKey::new("a")).await, 0);
        assert!(coordinator.list_recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_uploads_never_lose_updates() {
        let (temp, coordinator) = make(OverflowPolicy::Evict, 10_000, 50);
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let key = if i % 2 == 0 { "even" } else { "odd" };
                upload(&coordinator, key, &format!("{i}.bin"), 10, i as f64).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upload");
        }

        assert_eq!(coordinator.current_client_usage(&ClientKey::new("even")).await, 50);
        assert_eq!(coordinator.current_client_usage(&ClientKey::new("odd")).await, 50);
        assert_eq!(coordinator.blobs().list_blob_ids().await.expect("list").len(), 10);

        let reloaded = Ledger::load(temp.path().join("files.json")).await;
        assert_eq!(reloaded.total_usage(), 100);
        let recent = coordinator.list_recent(100).await;
        assert_eq!(recent.len(), 10);
        assert_eq!(
            reloaded.buckets().values().map(Vec::len).sum::<usize>(),
            recent.len()
        );
    }
}
