//! 上传频率限制：按客户端记录最近一次成功上传的时间。

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::client::ClientKey;

/// 状态只存在于进程生命周期内，重启后所有客户端都被遗忘。
#[derive(Debug)]
pub struct UploadThrottle {
    min_interval: Duration,
    last_upload: Mutex<HashMap<ClientKey, Instant>>,
}

impl UploadThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_upload: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.min_interval.is_zero()
    }

    /// 客户端还需等待的秒数（如有）。
    pub async fn check(&self, key: &ClientKey) -> Option<u64> {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &ClientKey, now: Instant) -> Option<u64> {
        if !self.is_enabled() {
            return None;
        }
        let last_upload = self.last_upload.lock().await;
        let last = last_upload.get(key)?;
        let elapsed = now.saturating_duration_since(*last);
        if elapsed >= self.min_interval {
            return None;
        }
        let wait = self.min_interval - elapsed;
        Some(wait.as_secs() + u64::from(wait.subsec_nanos() > 0))
    }

    /// 记录一次成功的上传。
    pub async fn record(&self, key: &ClientKey) {
        if !self.is_enabled() {
            return;
        }
        let mut last_upload = self.last_upload.lock().await;
        last_upload.insert(key.clone(), Instant::now());
    }

    /// 清理已过限制窗口的记录。
    pub async fn prune(&self) {
        let mut last_upload = self.last_upload.lock().await;
        let now = Instant::now();
        last_upload.retain(|_, last| now.saturating_duration_since(*last) < self.min_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_throttle_never_blocks() {
        let throttle = UploadThrottle::new(Duration::ZERO);
        let key = ClientKey::new("a");
        throttle.record(&key).await;
        assert_eq!(throttle.check(&key).await, None);
    }

    #[tokio::test]
    async fn blocks_until_interval_passes() {
        let throttle = UploadThrottle::new(Duration::from_secs(10));
        let key = ClientKey::new("a");
        assert_eq!(throttle.check(&key).await, None);

        throttle.record(&key).await;
        let wait = throttle.check(&key).await.expect("throttled");
        assert!((1..=10).contains(&wait));
        assert_eq!(throttle.check(&ClientKey::new("b")).await, None);

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(throttle.check_at(&key, later).await, None);
    }

    #[tokio::test]
    async fn prune_keeps_active_windows() {
        let throttle = UploadThrottle::new(Duration::from_secs(60));
        let key = ClientKey::new("a");
        throttle.record(&key).await;
        throttle.prune().await;
        assert!(throttle.check(&key).await.is_some());
    }
}
