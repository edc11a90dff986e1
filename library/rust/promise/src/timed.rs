use std::convert::Infallible;
use std::time::Duration;

use crate::cancelable::Cancelable;

/// `delay` 経過後に `()` で解決する Cancelable を返す。
pub fn timeout_promise(delay: Duration) -> Cancelable<(), Infallible> {
    timeout_promise_with(delay, || ())
}

/// `delay` 経過後に `producer` を評価し、その値で解決する Cancelable を返す。
///
/// キャンセルされるとタイマーごと破棄されるため、`producer` は呼ばれない。
pub fn timeout_promise_with<T, P>(delay: Duration, producer: P) -> Cancelable<T, Infallible>
where
    T: Clone + Send + Sync + 'static,
    P: FnOnce() -> T + Send + 'static,
{
    Cancelable::new(async move {
        tokio::time::sleep(delay).await;
        Ok(producer())
    })
}
