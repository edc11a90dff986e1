use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 添付ファイル名が取得できなかった場合の既定名。
pub const DEFAULT_ATTACHMENT_NAME: &str = "attachment";

static FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"filename[^;=\n]*=(?:"([^"]*)"|'([^']*)'|([^;\n]*))"#)
        .expect("filename の正規表現が不正")
});

/// JSON 以外のレスポンスボディ。
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub content_type: Option<String>,
    /// `Content-Disposition: attachment` で受け取った場合のファイル名。
    pub filename: Option<String>,
    pub data: Bytes,
}

/// 成功レスポンス。
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Json(Value),
    Blob(Blob),
}

impl ApiResponse {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Blob(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Self::Blob(blob) => Some(blob),
            Self::Json(_) => None,
        }
    }

    /// JSON レスポンスを任意の型へデシリアライズする。Blob は JSON として解釈を試みる。
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Blob(blob) => serde_json::from_slice(&blob.data),
        }
    }
}

/// Content-Type が JSON を示すかどうか。パラメータ（charset 等）は無視する。
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// `Content-Disposition` が attachment であればファイル名を返す。
///
/// filename パラメータがない場合は [`DEFAULT_ATTACHMENT_NAME`]。attachment でなければ None。
pub fn attachment_filename(disposition: &str) -> Option<String> {
    let disposition = disposition.trim();
    let kind = disposition.split(';').next().unwrap_or_default().trim();
    if !kind.eq_ignore_ascii_case("attachment") {
        return None;
    }
    let filename = FILENAME
        .captures(disposition)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().replace(['"', '\''], "").trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_ATTACHMENT_NAME.to_string());
    Some(filename)
}
