use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PromiseError;

/// Cancelable の決着結果。
pub type Settled<T, E> = Result<T, PromiseError<E>>;

/// 外部から中断できる非同期処理のハンドル。
///
/// 生成時に tokio タスクとして即時に実行を開始する。ハンドルは clone でき、
/// すべての clone が同じ決着結果を観測する。`cancel()` が先行した場合は
/// 本来の結果ではなく [`PromiseError::Canceled`] で決着する。
pub struct Cancelable<T, E> {
    inner: Shared<BoxFuture<'static, Settled<T, E>>>,
    token: CancellationToken,
}

impl<T, E> Cancelable<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_settled(future.map(|result| result.map_err(PromiseError::Rejected)))
    }

    /// 既に PromiseError を返す future をラップする。連鎖した Cancelable の
    /// キャンセルを上位へそのまま伝えるために使う。
    pub fn from_settled<F>(future: F) -> Self
    where
        F: Future<Output = Settled<T, E>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            // キャンセルと自然決着が同時に成立した場合はキャンセルを優先する
            tokio::select! {
                biased;
                () = child.cancelled() => Err(PromiseError::Canceled),
                settled = future => settled,
            }
        });
        let inner = async move {
            match handle.await {
                Ok(settled) => settled,
                Err(e) => Err(PromiseError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();
        Self { inner, token }
    }
}

impl<T, E> Cancelable<T, E> {
    /// 未決着であれば Canceled で決着させる。二回目以降の呼び出しは何もしない。
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Cancelable をキャンセル");
            self.token.cancel();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T, E> Clone for Cancelable<T, E>
where
    T: Clone,
    E: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T, E> Future for Cancelable<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Settled<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // キャンセル後に待ち始めた観測者は常に Canceled を見る
        if self.token.is_cancelled() {
            return Poll::Ready(Err(PromiseError::Canceled));
        }
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T, E> fmt::Debug for Cancelable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelable")
            .field("canceled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
