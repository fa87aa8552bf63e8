//! 过期清理与启动时账本和 Blob 存储的对账。
//!
//! 两者都由调用方持有账本写锁后执行。

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DropError;
use crate::ledger::{Ledger, LedgerOrigin};
use crate::storage::BlobStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub freed_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 因 Blob 已不存在而删除的记录数。
    pub dangling_records: usize,
    /// 因没有记录引用而删除的 Blob 数。
    pub orphan_blobs: usize,
}

/// 删除记录已移除的 Blob。失败只记日志，账本仍是权威。
pub async fn delete_blob_quietly(blobs: &BlobStore, blob_id: &str, reason: &'static str) {
    match blobs.delete(blob_id).await {
        Ok(true) => {}
        Ok(false) => debug!(blob_id, reason, "blob already gone"),
        Err(err) => warn!(blob_id, reason, error = %err, "failed to delete blob"),
    }
}

/// 一次过期清理：先修剪账本，再删除被修剪记录的 Blob。
pub async fn sweep_expired(
    ledger: &mut Ledger,
    blobs: &BlobStore,
    now: f64,
    max_age: Duration,
) -> Result<SweepReport, DropError> {
    let removed = ledger.prune_expired(now, max_age).await?;
    let mut report = SweepReport::default();
    for (key, record) in &removed {
        delete_blob_quietly(blobs, &record.blob_id, "expired").await;
        debug!(client = %key, blob_id = record.blob_id, "upload expired");
        report.removed += 1;
        report.freed_bytes += record.size_bytes;
    }
    if report.removed > 0 {
        info!(
            removed = report.removed,
            freed = report.freed_bytes,
            "expired uploads swept"
        );
    }
    Ok(report)
}

/// 恢复“每条记录都有 Blob、每个 Blob 都有记录”的不变式。账本无法读取时保留孤立
/// Blob，因为此时它们更可能是丢失的记账而不是残留文件。
pub async fn reconcile(ledger: &mut Ledger, blobs: &BlobStore) -> Result<ReconcileReport, DropError> {
    let present: HashSet<String> = blobs.list_blob_ids().await?.into_iter().collect();
    let dangling = ledger
        .retain(|record| present.contains(&record.blob_id))
        .await?;
    for (key, record) in &dangling {
        warn!(client = %key, blob_id = record.blob_id, "dropping record without blob");
    }

    let mut report = ReconcileReport {
        dangling_records: dangling.len(),
        orphan_blobs: 0,
    };

    if ledger.origin() == LedgerOrigin::Unreadable {
        let tracked = ledger.blob_ids();
        let untracked = present.iter().filter(|id| !tracked.contains(id.as_str())).count();
        if untracked > 0 {
            warn!(untracked, "ledger was unreadable, leaving untracked blobs in place");
        }
        return Ok(report);
    }

    let orphans: Vec<String> = {
        let tracked = ledger.blob_ids();
        present
            .into_iter()
            .filter(|id| !tracked.contains(id.as_str()))
            .collect()
    };
    for blob_id in &orphans {
        warn!(blob_id, "deleting blob without record");
        delete_blob_quietly(blobs, blob_id, "orphan").await;
    }
    report.orphan_blobs = orphans.len();
    Ok(report)
}
