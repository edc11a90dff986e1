//! fetchkit-promise: 非同期処理の制御プリミティブ。
//!
//! キャンセル可能なハンドル、遅延実行、キー単位の重複排除、決着結果のキャッシュを提供する。
//! すべて tokio ランタイム上で動作する。

pub mod cachable;
pub mod cancelable;
pub mod delayed;
pub mod error;
pub mod singular;
pub mod timed;

pub use cachable::{
    CachablePredicate, Cachable, CachePolicy, CachedOutcome, LruStore, OutcomeStore,
    UnboundedStore,
};
pub use cancelable::{Cancelable, Settled};
pub use delayed::Delayed;
pub use error::PromiseError;
pub use singular::Singular;
pub use timed::{timeout_promise, timeout_promise_with};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// ロックを取得する。保護対象は単純なマップのみのため、poison 状態でも中身をそのまま使う。
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
