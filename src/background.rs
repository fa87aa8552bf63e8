//! 过期清理、暂存文件清理与限流记录清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{STAGING_CLEAN_INTERVAL_SECS, Settings, THROTTLE_PRUNE_INTERVAL_SECS};
use crate::coordinator::Coordinator;
use crate::throttle::UploadThrottle;

/// 启动后台任务。`cleanup_interval` 为 0 时不启动周期性过期清理。
pub fn spawn_background_tasks(
    coordinator: Arc<Coordinator>,
    throttle: Arc<UploadThrottle>,
    settings: Arc<Settings>,
) {
    if settings.cleanup_interval.is_zero() {
        info!("periodic expiry sweep disabled");
    } else {
        let coordinator = coordinator.clone();
        let period = settings.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(err) = coordinator.sweep().await {
                    warn!(error = %err, "periodic sweep failed");
                }
            }
        });
    }

    let staging_ttl = settings.staging_ttl;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match coordinator.blobs().cleanup_stale_staging(staging_ttl).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "stale staging files removed"),
                Err(err) => warn!(error = %err, "staging cleanup failed"),
            }
        }
    });

    if throttle.is_enabled() {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(THROTTLE_PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                throttle.prune().await;
            }
        });
    }
}
