//! fetchkit-api: HTTP/JSON API クライアント。
//!
//! - ベース URL への相対パスの解決と、アプリ側 camelCase ⇄ ワイヤ側 snake_case のキー名変換
//! - レスポンスの分類（JSON・Blob・添付ファイル・202 遅延タスク・エラー）
//! - 202 応答に対するタスク状態のポーリング（タスク ID ごとのリトライ回数管理）
//! - GET 結果のキャッシュと、同一 GET の重複排除
//!
//! 失敗はすべて [`ApiError`] に集約され、登録済みのエラーオブザーバーへ配信される。

pub mod casing;
pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod logger;
pub mod request;
pub mod response;
pub mod stats;
pub mod task;
pub mod urls;

pub use client::{ApiClient, ApiClientBuilder, ErrorObserver};
pub use config::{ApiClientConfig, ConfigError, CredentialsMode, RequestMode};
pub use download::{AttachmentSink, DownloadError, FsAttachmentSink, MemoryAttachmentSink};
pub use error::{code_type, ApiError, ApiErrorKind, CODE_NETWORK, CODE_TASK_TIMEOUT};
pub use request::{RequestDescriptor, RequestOptions};
pub use response::{ApiResponse, Blob};
pub use stats::StatsSource;
pub use task::{PollDecision, TaskRetryLedger, TaskTicket};

#[cfg(feature = "mock")]
pub use download::MockAttachmentSink;

pub use fetchkit_promise::{Cancelable, PromiseError};
