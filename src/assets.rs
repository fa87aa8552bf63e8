//! 嵌入式静态资源：状态页模板、样式、脚本与客户端上传脚本。

use axum::body::Body as AxumBody;
use axum::extract::Path;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "assets"]
/// 嵌入式资源目录。
pub struct Assets;

const STATIC_FILES: [&str; 2] = ["styles.css", "app.js"];
pub const INDEX_TEMPLATE: &str = "index.html";
pub const UPLOAD_SCRIPT: &str = "upload.sh";

/// `/static/{file}`：只对外提供样式表与脚本。
pub async fn serve_static(Path(file): Path<String>) -> Result<Response, ApiError> {
    if !STATIC_FILES.contains(&file.as_str()) {
        return Err(ApiError::NotFound("not found".into()));
    }
    load_asset(&file)?.ok_or_else(|| ApiError::NotFound("not found".into()))
}

/// `/upload.sh`：客户端脚本，以附件形式下载。
pub async fn serve_upload_script() -> Result<Response, ApiError> {
    let asset = Assets::get(UPLOAD_SCRIPT)
        .ok_or_else(|| ApiError::Internal("upload script missing from build".into()))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(r#"attachment; filename="upload.sh""#),
    );
    Ok((headers, AxumBody::from(asset.data.into_owned())).into_response())
}

/// 加载指定路径的嵌入式资源。
fn load_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = Assets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}

/// 填充内嵌模板中的 `{{name}}` 占位符。值按原样插入，调用方需先转义。
pub fn render_template(name: &str, values: &[(&str, String)]) -> Result<String, ApiError> {
    let asset =
        Assets::get(name).ok_or_else(|| ApiError::Internal(format!("template {name} missing")))?;
    let mut page = String::from_utf8_lossy(&asset.data).into_owned();
    for (key, value) in values {
        page = page.replace(&format!("{{{{{key}}}}}"), value);
    }
    Ok(page)
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
