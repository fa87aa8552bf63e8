//! 配额准入：全局上限与单客户端上限的判定。

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::client::ClientKey;
use crate::error::DropError;
use crate::ledger::Ledger;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// 上传会让客户端超出上限时的处理策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// 从最旧的上传开始驱逐，直到新文件放得下。
    Evict,
    /// 拒绝上传，不动已有文件。
    Reject,
}

/// 配额设置换算失败。
#[derive(Debug, Error, PartialEq)]
pub enum LimitsError {
    #[error("{name} must be a non-negative number of GB, got {value}")]
    InvalidSize { name: &'static str, value: f64 },
    #[error("max age must be a non-negative number of hours, got {0}")]
    InvalidAge(f64),
}

/// 内部单位的上限，启动时换算一次。
#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub global_cap_bytes: u64,
    pub client_cap_bytes: u64,
    pub max_age: Duration,
    pub policy: OverflowPolicy,
}

impl Limits {
    /// 把 GB 与小时换算为字节与时长。
    pub fn from_settings(
        max_storage_gb: f64,
        client_limit_gb: f64,
        max_age_hours: f64,
        policy: OverflowPolicy,
    ) -> Result<Self, LimitsError> {
        Ok(Self {
            global_cap_bytes: gb_to_bytes("max storage", max_storage_gb)?,
            client_cap_bytes: gb_to_bytes("per-client limit", client_limit_gb)?,
            max_age: hours_to_duration(max_age_hours)?,
            policy,
        })
    }

    /// 单次上传在任何情况下都不可能被接受的字节数下限。
    ///
    /// 驱逐模式下客户端的整个桶都可以腾出，只剩全局上限约束；拒绝模式下
    /// 两个上限同时生效。
    pub fn upload_ceiling(&self) -> u64 {
        match self.policy {
            OverflowPolicy::Evict => self.global_cap_bytes,
            OverflowPolicy::Reject => self.client_cap_bytes.min(self.global_cap_bytes),
        }
    }

    /// 传输中途越过 [`Limits::upload_ceiling`] 时返回的拒绝原因。
    pub fn oversize(&self, received: u64) -> RejectReason {
        if self.policy == OverflowPolicy::Reject && self.client_cap_bytes <= self.global_cap_bytes
        {
            RejectReason::PerClientCapExceeded {
                requested: received,
                limit: self.client_cap_bytes,
            }
        } else {
            RejectReason::InsufficientSpace {
                requested: received,
                available: self.global_cap_bytes,
            }
        }
    }
}

fn gb_to_bytes(name: &'static str, gb: f64) -> Result<u64, LimitsError> {
    if !gb.is_finite() || gb < 0.0 {
        return Err(LimitsError::InvalidSize { name, value: gb });
    }
    Ok((gb * BYTES_PER_GB).round() as u64)
}

fn hours_to_duration(hours: f64) -> Result<Duration, LimitsError> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(LimitsError::InvalidAge(hours));
    }
    Ok(Duration::from_secs_f64(hours * SECONDS_PER_HOUR))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientSpace { requested: u64, available: u64 },
    PerClientCapExceeded { requested: u64, limit: u64 },
}

impl From<RejectReason> for DropError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::InsufficientSpace {
                requested,
                available,
            } => DropError::InsufficientSpace {
                requested,
                available,
            },
            RejectReason::PerClientCapExceeded { requested, limit } => {
                DropError::PerClientCapExceeded { requested, limit }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// 先驱逐客户端桶中最旧的 `evict` 条记录，再接受上传。
    Accept { evict: usize, evicted_bytes: u64 },
    Reject(RejectReason),
}

/// 判断 `key` 能否再放入 `size` 字节。纯函数，只给出驱逐计划，由调用方执行。
/// 被拒绝的上传不会让客户端失去任何已有文件。
///
/// 驱逐模式下超出单客户端上限时，从最旧的记录开始计划驱逐，必要时清空整个
/// 桶；随后全局检查按驱逐后的用量计算。
pub fn admit(ledger: &Ledger, limits: &Limits, key: &ClientKey, size: u64) -> Decision {
    let cap = limits.client_cap_bytes;
    let client_usage = ledger.usage(key);
    let mut evict = 0;
    let mut evicted_bytes = 0;

    if client_usage.saturating_add(size) > cap {
        if limits.policy == OverflowPolicy::Reject {
            return Decision::Reject(RejectReason::PerClientCapExceeded {
                requested: size,
                limit: cap,
            });
        }
        for record in ledger.bucket(key) {
            if (client_usage - evicted_bytes).saturating_add(size) <= cap {
                break;
            }
            evict += 1;
            evicted_bytes += record.size_bytes;
        }
    }

    let remaining = ledger.total_usage().saturating_sub(evicted_bytes);
    if remaining.saturating_add(size) > limits.global_cap_bytes {
        return Decision::Reject(RejectReason::InsufficientSpace {
            requested: size,
            available: limits.global_cap_bytes.saturating_sub(remaining),
        });
    }

    Decision::Accept {
        evict,
        evicted_bytes,
    }
}
