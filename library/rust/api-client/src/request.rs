use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::config::{CredentialsMode, RequestMode};

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// 呼び出し単位のオプション。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// クエリ文字列にエンコードする JSON オブジェクト。
    pub query: Option<Value>,
    /// JSON ボディ。
    pub body: Option<Value>,
    pub task_wait_timeout: Option<Duration>,
    pub task_max_retries: Option<u32>,
    /// キー名変換の有効・無効。None の場合は設定値に従う。
    pub transform_keys: Option<bool>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn task_wait_timeout(mut self, timeout: Duration) -> Self {
        self.task_wait_timeout = Some(timeout);
        self
    }

    pub fn task_max_retries(mut self, retries: u32) -> Self {
        self.task_max_retries = Some(retries);
        self
    }

    pub fn transform_keys(mut self, enabled: bool) -> Self {
        self.transform_keys = Some(enabled);
        self
    }
}

/// 送信するリクエストの記述子。呼び出しごとに新しく組み立て、以降は変更しない。
///
/// エラー発生時には診断用に [`crate::ApiError`] へ添付される。
#[derive(Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// クエリ文字列を含む最終的な URL。
    pub url: String,
    pub mode: RequestMode,
    pub credentials: CredentialsMode,
    pub headers: Vec<(String, String)>,
    /// シリアライズ済みの JSON ボディ。
    pub body: Option<String>,
}

impl RequestDescriptor {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Authorization の値はログ・診断出力に含めない
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                if name.eq_ignore_ascii_case(AUTHORIZATION_HEADER) {
                    (name.as_str(), "[REDACTED]")
                } else {
                    (name.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("mode", &self.mode)
            .field("credentials", &self.credentials)
            .field("headers", &headers)
            .field("body", &self.body)
            .finish()
    }
}
