//! 客户端身份：上传按此键分桶计算配额。

use axum::http::HeaderMap;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::{Authorization, HeaderMapExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

pub const UPLOAD_TOKEN_HEADER: &str = "x-upload-token";

/// 拥有账本桶的不透明身份：IP 地址或上传令牌。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 签发新的上传令牌。
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 请求映射到 [`ClientKey`] 的方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// 按客户端地址分桶（`X-Real-IP`、`X-Forwarded-For`、对端地址）。
    Ip,
    /// 按客户端出示或新签发的上传令牌分桶。
    Token,
}

impl KeyMode {
    /// 纯文本响应中使用的标签。
    pub fn label(self) -> &'static str {
        match self {
            KeyMode::Ip => "Your IP",
            KeyMode::Token => "Token",
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            KeyMode::Ip => "IP",
            KeyMode::Token => "token",
        }
    }

    /// 状态页可以显示的 `key`。令牌属于凭据，从不显示。
    pub fn public_label(self, key: &ClientKey) -> &str {
        match self {
            KeyMode::Ip => key.as_str(),
            KeyMode::Token => "-",
        }
    }
}

/// 解析出的身份；本次请求新签发令牌时 `issued` 为真。
#[derive(Clone, Debug)]
pub struct Identity {
    pub key: ClientKey,
    pub issued: bool,
}

/// 优先取代理头中的客户端地址，否则退回套接字对端地址。
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    header_value("x-real-ip")
        .or_else(|| {
            header_value("x-forwarded-for").and_then(|value| {
                value
                    .split(',')
                    .next()
                    .map(str::trim)
                    .filter(|first| !first.is_empty())
                    .map(str::to_string)
            })
        })
        .or_else(|| peer.map(|ip| ip.to_string()))
}

/// 依次从 `X-Upload-Token`、Bearer `Authorization` 头或 `?token=` 取上传令牌。
pub fn upload_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<ClientKey> {
    if let Some(token) = headers
        .get(UPLOAD_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(ClientKey::new(token));
    }
    if let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() {
        let token = bearer.token().trim();
        if !token.is_empty() {
            return Some(ClientKey::new(token));
        }
    }
    query_token
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ClientKey::new)
}

/// 解析调用方身份。`issue_token` 为真时，令牌模式在请求未携带令牌的情况下签发新令牌而不是失败。
pub fn resolve_identity(
    mode: KeyMode,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    query_token: Option<&str>,
    issue_token: bool,
) -> Option<Identity> {
    match mode {
        KeyMode::Ip => client_ip(headers, peer).map(|ip| Identity {
            key: ClientKey::new(ip),
            issued: false,
        }),
        KeyMode::Token => match upload_token(headers, query_token) {
            Some(key) => Some(Identity { key, issued: false }),
            None if issue_token => Some(Identity {
                key: ClientKey::generate(),
                issued: true,
            }),
            None => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    #[test]
    fn real_ip_wins_over_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(client_ip(&headers, None).as_deref(), Some("10.0.0.1"));

        headers.insert("x-real-ip", HeaderValue::from_static(" 192.0.2.7 "));
        assert_eq!(client_ip(&headers, None).as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn peer_address_is_the_fallback() {
        let peer = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(client_ip(&HeaderMap::new(), peer).as_deref(), Some("203.0.113.9"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn token_sources_in_priority_order() {
        let mut headers = HeaderMap::new();
        assert_eq!(upload_token(&headers, Some(" q ")), Some(ClientKey::new("q")));

        headers.insert("authorization", HeaderValue::from_static("Bearer bearer-token"));
        assert_eq!(
            upload_token(&headers, Some("q")),
            Some(ClientKey::new("bearer-token"))
        );

        headers.insert(UPLOAD_TOKEN_HEADER, HeaderValue::from_static("header-token"));
        assert_eq!(
            upload_token(&headers, Some("q")),
            Some(ClientKey::new("header-token"))
        );
    }

    #[test]
    fn token_mode_issues_only_when_asked() {
        let headers = HeaderMap::new();
        assert!(resolve_identity(KeyMode::Token, &headers, None, None, false).is_none());

        let identity =
            resolve_identity(KeyMode::Token, &headers, None, None, true).expect("issued");
        assert!(identity.issued);
        assert_eq!(identity.key.as_str().len(), 32);
    }
}
