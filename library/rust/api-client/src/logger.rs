//! 構造化ログの初期化。
//!
//! クライアントは `tracing` でリクエスト送信・タスクのポーリング・API エラーを記録する。
//! アプリケーション側で subscriber を用意しない場合はここで初期化できる。
//!
//! ```ignore
//! fetchkit_api::logger::init_logger("dev", "text");
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 環境名から fetchkit 系クレートのログレベルを決める。
///
/// - dev: debug
/// - staging: info
/// - それ以外: warn
pub fn level_for_env(env: &str) -> &'static str {
    match env {
        "dev" => "debug",
        "staging" => "info",
        _ => "warn",
    }
}

/// `RUST_LOG` が設定されていればそちらを優先する。
fn filter_for_env(env: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level_for_env(env);
        EnvFilter::new(format!(
            "warn,fetchkit_api={level},fetchkit_promise={level}"
        ))
    })
}

/// tracing-subscriber を初期化する。format が "text" の場合はプレーンテキスト、それ以外は JSON。
///
/// 既にグローバル subscriber が設定済みの場合は何もせず false を返す。
pub fn init_logger(env: &str, format: &str) -> bool {
    let registry = tracing_subscriber::registry().with(filter_for_env(env));

    if format == "text" {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .is_ok()
    }
}
