use std::convert::Infallible;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::cancelable::Cancelable;
use crate::error::PromiseError;
use crate::lock;
use crate::timed::timeout_promise;

/// 呼び出しを debounce するディスパッチャ。
///
/// 新しい呼び出しは待機中のタイマーをキャンセルしてから再スケジュールする。
/// 待機中に置き換えられた呼び出しの factory は実行されず、Canceled で決着する。
#[derive(Default)]
pub struct Delayed {
    timer: Mutex<Option<Cancelable<(), Infallible>>>,
}

impl Delayed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch<T, E, F, Fut>(&self, factory: F, delay: Duration) -> Cancelable<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let timer = timeout_promise(delay);
        if let Some(previous) = lock(&self.timer).replace(timer.clone()) {
            if !previous.is_canceled() {
                debug!("待機中の遅延呼び出しを置き換え");
            }
            // 発火済みのタイマーに対しては何も起きない。開始済みの factory は継続する
            previous.cancel();
        }
        Cancelable::from_settled(async move {
            match timer.await {
                Ok(()) => factory().await.map_err(PromiseError::Rejected),
                Err(PromiseError::Aborted(reason)) => Err(PromiseError::Aborted(reason)),
                Err(_) => Err(PromiseError::Canceled),
            }
        })
    }

    /// 待機中の呼び出しがあればキャンセルする。
    pub fn cancel(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
    }
}
