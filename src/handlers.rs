//! HTTP 处理器：上传、下载、清理、用量查询与状态页。

use axum::body::Body as AxumBody;
use axum::extract::{ConnectInfo, Extension, FromRequest, Multipart, Path, Query};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{Html, IntoResponse, Json as JsonResponse, Response};
use chrono::{DateTime, Local};
use http_body_util::BodyExt;
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::assets::{INDEX_TEMPLATE, escape_html, render_template};
use crate::client::{ClientKey, Identity, KeyMode, resolve_identity};
use crate::config::Settings;
use crate::coordinator::{Coordinator, Receipt};
use crate::error::{ApiError, DropError};
use crate::ledger::UploadRecord;
use crate::quota::{BYTES_PER_GB, Decision, Limits, OverflowPolicy};
use crate::storage::{StagedBlob, display_name, new_blob_id};
use crate::throttle::UploadThrottle;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const MULTIPART_FIELD: &str = "file";

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    used_bytes: u64,
    total_bytes: u64,
    client_limit_bytes: u64,
    max_age_hours: f64,
    overflow: OverflowPolicy,
    key_mode: KeyMode,
    recent: Vec<RecentUpload>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentUpload {
    blob_id: String,
    name: String,
    size_bytes: u64,
    uploaded_at: f64,
    expires_at: f64,
    client: String,
}

/// 处理请求前先执行一次过期清理。清理失败只记日志，请求照常继续，下一次请求会重试。
async fn refresh(coordinator: &Coordinator) {
    if let Err(err) = coordinator.sweep().await {
        warn!(error = %err, "request-time sweep failed");
    }
}

fn gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn local_time(timestamp: f64) -> String {
    DateTime::from_timestamp(timestamp.floor() as i64, 0)
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn expires_at(record: &UploadRecord, settings: &Settings) -> f64 {
    record.created_at + settings.limits.max_age.as_secs_f64()
}

fn require_identity(
    settings: &Settings,
    headers: &HeaderMap,
    peer: SocketAddr,
    query: &TokenQuery,
) -> Result<Identity, ApiError> {
    resolve_identity(
        settings.key_mode,
        headers,
        Some(peer.ip()),
        query.token.as_deref(),
        false,
    )
    .ok_or_else(|| ApiError::BadRequest("Missing upload token".into()))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
}

/// `POST /upload`：multipart 的 `file` 字段或原始请求体。
pub async fn upload(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(throttle): Extension<Arc<UploadThrottle>>,
    Extension(settings): Extension<Arc<Settings>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    refresh(&coordinator).await;

    let headers = request.headers().clone();
    let identity = resolve_identity(
        settings.key_mode,
        &headers,
        Some(peer.ip()),
        query.token.as_deref(),
        true,
    )
    .ok_or_else(|| ApiError::BadRequest("Unable to determine client identity".into()))?;
    let key = &identity.key;

    if let Some(wait) = throttle.check(key).await {
        info!(client = %key, wait, "upload throttled");
        return Err(ApiError::TooManyRequests(wait));
    }

    let limits = coordinator.limits();
    let staged = if is_multipart(&headers) {
        stage_multipart(&coordinator, request, limits).await?
    } else {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        if let Some(size) = declared
            && let Decision::Reject(reason) = coordinator.admit_upload(key, size).await
        {
            let used = coordinator.current_client_usage(key).await;
            info!(
                client = %key,
                size,
                used,
                reason = ?reason,
                "upload refused before transfer"
            );
            return Err(DropError::from(reason).into());
        }
        let body = pin!(BodyExt::into_data_stream(request.into_body()));
        coordinator
            .blobs()
            .stage(new_blob_id(None), body, limits.upload_ceiling())
            .await
            .map_err(|err| over_ceiling(limits, err))?
    };

    let receipt = coordinator.commit_upload(key, staged).await?;
    throttle.record(key).await;

    let base_url = crate::http::public_base_url(&headers, settings.public_url.as_deref());
    let body = upload_summary(&settings, &identity, &receipt, &base_url);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// 暂存时越过上限的错误换成与准入判定一致的拒绝原因。
fn over_ceiling(limits: &Limits, err: DropError) -> DropError {
    match err {
        DropError::UploadTooLarge { received, .. } => limits.oversize(received).into(),
        other => other,
    }
}

async fn stage_multipart(
    coordinator: &Coordinator,
    request: Request<AxumBody>,
    limits: &Limits,
) -> Result<StagedBlob, ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?
            .ok_or_else(|| ApiError::BadRequest("No file uploaded".into()))?;
        if field.name() != Some(MULTIPART_FIELD) {
            continue;
        }
        let blob_id = new_blob_id(field.file_name());
        let field = pin!(field);
        return Ok(coordinator
            .blobs()
            .stage(blob_id, field, limits.upload_ceiling())
            .await
            .map_err(|err| over_ceiling(limits, err))?);
    }
}

fn upload_summary(
    settings: &Settings,
    identity: &Identity,
    receipt: &Receipt,
    base_url: &str,
) -> String {
    let limits = &settings.limits;
    let record = &receipt.record;
    let mut lines = vec![
        format!("{base_url}/download/{}", record.blob_id),
        format!("{}: {}", settings.key_mode.label(), identity.key),
        format!("File size: {:.2} MB", mb(record.size_bytes)),
        format!("Expires: {}", local_time(expires_at(record, settings))),
        format!(
            "Allocated space remaining: {:.2} GB",
            gb(limits.global_cap_bytes.saturating_sub(receipt.global_usage))
        ),
        format!(
            "Per-client limit remaining: {:.2} GB",
            gb(limits.client_cap_bytes.saturating_sub(receipt.client_usage))
        ),
    ];
    if !receipt.evicted.is_empty() {
        let freed: u64 = receipt.evicted.iter().map(|r| r.size_bytes).sum();
        lines.push(format!(
            "Replaced {} older file(s), {:.2} MB",
            receipt.evicted.len(),
            mb(freed)
        ));
    }
    lines.join("\n")
}

/// `GET /download/{blobId}`：以附件形式流式返回 Blob。
pub async fn download(
    Path(blob_id): Path<String>,
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Result<Response, ApiError> {
    refresh(&coordinator).await;

    let (file, metadata) = coordinator.open_blob(&blob_id).await?;
    let size = metadata.len();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            display_name(&blob_id)
        ))
        .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    if let Ok(modified) = metadata.modified()
        && let Ok(value) = HeaderValue::from_str(&fmt_http_date(modified))
    {
        response_headers.insert(header::LAST_MODIFIED, value);
    }

    info!(blob_id, size, "download");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// `POST /clear`：删除调用方的全部上传。
pub async fn clear(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(settings): Extension<Arc<Settings>>,
) -> Result<String, ApiError> {
    refresh(&coordinator).await;

    let identity = require_identity(&settings, &headers, peer, &query)?;
    let freed = coordinator.clear(&identity.key).await?;
    Ok(format!(
        "Cleared files for {} {}. Freed {:.2} MB",
        settings.key_mode.noun(),
        identity.key,
        mb(freed)
    ))
}

/// `GET|POST /token`：调用方的用量摘要。
pub async fn usage(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(settings): Extension<Arc<Settings>>,
) -> Result<String, ApiError> {
    refresh(&coordinator).await;

    let identity = require_identity(&settings, &headers, peer, &query)?;
    let summary = coordinator.client_summary(&identity.key).await;
    Ok(format!(
        "{}: {}\nFiles: {}\nUsed: {:.2} GB\nRemaining: {:.2} GB",
        settings.key_mode.label(),
        identity.key,
        summary.files,
        gb(summary.used_bytes),
        gb(summary.remaining_bytes)
    ))
}

/// `GET /` 状态页。
pub async fn index(
    headers: HeaderMap,
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(settings): Extension<Arc<Settings>>,
) -> Result<Html<String>, ApiError> {
    refresh(&coordinator).await;

    let limits = &settings.limits;
    let used = coordinator.current_global_usage().await;
    let percentage = if limits.global_cap_bytes > 0 {
        used as f64 / limits.global_cap_bytes as f64 * 100.0
    } else {
        0.0
    };
    let overflow_note = match limits.policy {
        OverflowPolicy::Evict => "oldest files are replaced when full",
        OverflowPolicy::Reject => "uploads are refused when full",
    };
    let base_url = crate::http::public_base_url(&headers, settings.public_url.as_deref());

    let recent = coordinator.list_recent(settings.recent_limit).await;
    let recent_rows = if recent.is_empty() {
        "            <tr><td colspan=\"5\">No uploads yet</td></tr>".to_string()
    } else {
        recent
            .iter()
            .map(|(key, record)| recent_row(&settings, key, record))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let page = render_template(
        INDEX_TEMPLATE,
        &[
            ("percentage", format!("{percentage:.1}")),
            ("used_gb", format!("{:.2}", gb(used))),
            ("total_gb", format!("{:.2}", gb(limits.global_cap_bytes))),
            (
                "max_age_hours",
                format!("{}", limits.max_age.as_secs_f64() / 3600.0),
            ),
            (
                "client_limit_gb",
                format!("{:.2}", gb(limits.client_cap_bytes)),
            ),
            ("overflow_note", overflow_note.to_string()),
            ("base_url", escape_html(&base_url)),
            ("recent_rows", recent_rows),
        ],
    )?;
    Ok(Html(page))
}

fn recent_row(settings: &Settings, key: &ClientKey, record: &UploadRecord) -> String {
    format!(
        "            <tr><td><a href=\"/download/{}\">{}</a></td><td>{:.2} MB</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        escape_html(&record.blob_id),
        escape_html(display_name(&record.blob_id)),
        mb(record.size_bytes),
        local_time(record.created_at),
        local_time(expires_at(record, settings)),
        escape_html(settings.key_mode.public_label(key)),
    )
}

/// `GET /api/status`：JSON 格式的用量与最近上传。
pub async fn api_status(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(settings): Extension<Arc<Settings>>,
) -> Result<JsonResponse<StatusReport>, ApiError> {
    refresh(&coordinator).await;

    let limits = &settings.limits;
    let recent = coordinator
        .list_recent(settings.recent_limit)
        .await
        .into_iter()
        .map(|(key, record)| RecentUpload {
            name: display_name(&record.blob_id).to_string(),
            expires_at: expires_at(&record, &settings),
            client: settings.key_mode.public_label(&key).to_string(),
            blob_id: record.blob_id,
            size_bytes: record.size_bytes,
            uploaded_at: record.created_at,
        })
        .collect();

    Ok(JsonResponse(StatusReport {
        used_bytes: coordinator.current_global_usage().await,
        total_bytes: limits.global_cap_bytes,
        client_limit_bytes: limits.client_cap_bytes,
        max_age_hours: limits.max_age.as_secs_f64() / 3600.0,
        overflow: limits.policy,
        key_mode: settings.key_mode,
        recent,
    }))
}
