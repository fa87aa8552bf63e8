//! 统一的错误类型：核心账本错误与 HTTP 响应转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io;
use thiserror::Error;
use tracing::error;

/// 账本、配额与 Blob 存储产生的错误。
#[derive(Debug, Error)]
pub enum DropError {
    /// 会超出全局存储上限。
    #[error("not enough allocated space: requested {requested} bytes, {available} available")]
    InsufficientSpace { requested: u64, available: u64 },

    /// 仅在超限策略为 `reject` 时返回；驱逐模式会清空桶后再做全局检查。
    #[error("per-client limit exceeded: requested {requested} bytes, limit {limit}")]
    PerClientCapExceeded { requested: u64, limit: u64 },

    /// 暂存时载荷越过了字节上限，传输已中止。
    #[error("upload too large: received {received} bytes, limit {limit}")]
    UploadTooLarge { received: u64, limit: u64 },

    /// 账本写入失败，操作未提交。
    #[error("ledger persistence failed: {0}")]
    Persistence(#[source] io::Error),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("invalid blob id")]
    InvalidBlobId,

    /// 等待账本锁超时。
    #[error("ledger busy")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 请求级错误，以纯文本响应返回。
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    TooManyRequests(u64),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                let msg = format!("Rate limit: wait {retry_after} seconds between uploads.");
                (StatusCode::TOO_MANY_REQUESTS, headers, msg).into_response()
            }
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<DropError> for ApiError {
    fn from(err: DropError) -> Self {
        match err {
            DropError::InsufficientSpace { .. } => {
                ApiError::PayloadTooLarge("Not enough allocated space".into())
            }
            DropError::PerClientCapExceeded { .. } => ApiError::PayloadTooLarge(
                "Per-client limit exceeded. Run ./upload.sh --clear and retry.".into(),
            ),
            DropError::UploadTooLarge { limit, .. } => {
                ApiError::PayloadTooLarge(format!("Upload exceeds {limit} bytes"))
            }
            DropError::BlobNotFound(_) | DropError::InvalidBlobId => {
                ApiError::NotFound("not found".into())
            }
            DropError::Busy => ApiError::ServiceUnavailable("server busy, retry later".into()),
            DropError::Persistence(err) => {
                error!(error = %err, "ledger write failed");
                ApiError::Internal("failed to record upload".into())
            }
            DropError::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => ApiError::NotFound("not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_payload_too_large() {
        let response = ApiError::from(DropError::InsufficientSpace {
            requested: 10,
            available: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = ApiError::from(DropError::PerClientCapExceeded {
            requested: 10,
            limit: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = ApiError::from(DropError::UploadTooLarge {
            received: 11,
            limit: 10,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let response = ApiError::from(DropError::BlobNotFound("x.bin".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError::from(DropError::InvalidBlobId).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn throttle_sets_retry_after() {
        let response = ApiError::TooManyRequests(7).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("7")
        );
    }
}
