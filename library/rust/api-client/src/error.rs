use serde_json::Value;
use thiserror::Error;

use crate::request::RequestDescriptor;

/// 通信レベルの失敗（レスポンス未受信）を表すコード。
pub const CODE_NETWORK: i32 = -1;
/// 非同期タスク・統計情報のポーリングが上限に達したことを表すコード。
pub const CODE_TASK_TIMEOUT: i32 = 600;

/// コードから分類ラベルを引く。表にないコードは None。
pub fn code_type(code: i32) -> Option<&'static str> {
    match code {
        CODE_NETWORK => Some("REQUEST ERROR"),
        200 => Some("OK"),
        202 => Some("ACCEPTED"),
        403 => Some("FORBIDDEN"),
        404 => Some("NOT FOUND"),
        422 => Some("UNPROCESSABLE ENTITY"),
        500 => Some("INTERNAL SERVER ERROR"),
        502 => Some("BAD GATEWAY"),
        504 => Some("GATEWAY TIMEOUT"),
        CODE_TASK_TIMEOUT => Some("TASK TIMEOUT"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiErrorKind {
    #[error("通信エラー: {message}")]
    Network { message: String },
    #[error("API エラー {code}: {message}")]
    Http { code: i32, message: String },
    #[error("レスポンスのデコードに失敗しました (status={status}): {message}")]
    Decode { status: u16, message: String },
    #[error("タスクの最大リトライ回数を超過しました: {task_id}")]
    TaskTimeout { task_id: String },
    #[error("統計情報の取得がタイムアウトしました: {id}")]
    StatsTimeout { id: String },
}

/// API 呼び出しの失敗。
///
/// `request` には失敗したリクエストの記述子、`details` にはサーバーが返した
/// エラーボディ（ある場合）を保持する。構築後、エラーオブザーバーへ配信された
/// 時点以降は変更しない。
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request: Option<RequestDescriptor>,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind) -> Self {
        Self {
            kind,
            request: None,
            details: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network {
            message: message.into(),
        })
    }

    pub fn http(code: i32, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Http {
            code,
            message: message.into(),
        })
    }

    pub fn decode(status: u16, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Decode {
            status,
            message: message.into(),
        })
    }

    pub fn task_timeout(task_id: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::TaskTimeout {
            task_id: task_id.into(),
        })
    }

    pub fn stats_timeout(id: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::StatsTimeout { id: id.into() })
    }

    pub fn with_request(mut self, request: RequestDescriptor) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> i32 {
        match &self.kind {
            ApiErrorKind::Network { .. } => CODE_NETWORK,
            ApiErrorKind::Http { code, .. } => *code,
            ApiErrorKind::Decode { status, .. } => i32::from(*status),
            ApiErrorKind::TaskTimeout { .. } | ApiErrorKind::StatsTimeout { .. } => {
                CODE_TASK_TIMEOUT
            }
        }
    }

    pub fn code_type(&self) -> Option<&'static str> {
        code_type(self.code())
    }

    /// 利用者向けのメッセージ。HTTP エラーではサーバーが返した文言をそのまま使う。
    pub fn message(&self) -> String {
        match &self.kind {
            ApiErrorKind::Network { message }
            | ApiErrorKind::Http { message, .. }
            | ApiErrorKind::Decode { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, ApiErrorKind::Network { .. })
    }
}
