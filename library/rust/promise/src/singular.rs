use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::cancelable::Cancelable;
use crate::lock;

struct Entry<T, E> {
    generation: u64,
    promise: Cancelable<T, E>,
}

struct SingularState<T, E> {
    next_generation: u64,
    pending: HashMap<String, Entry<T, E>>,
}

/// キーごとに実行中の処理を高々一つに保つディスパッチャ。
///
/// 同じキーで決着前に再度呼ばれた場合は実行中のハンドルをそのまま返し、
/// factory は呼ばない。
pub struct Singular<T, E> {
    state: Arc<Mutex<SingularState<T, E>>>,
}

impl<T, E> Singular<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SingularState {
                next_generation: 0,
                pending: HashMap::new(),
            })),
        }
    }

    /// `key` で実行中の処理があればそれを返し、なければ `factory` を実行して登録する。
    ///
    /// `cancel_others` が true の場合、開始前に他のキーの処理をすべてキャンセルする。
    pub fn dispatch<F, Fut>(&self, factory: F, key: &str, cancel_others: bool) -> Cancelable<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut state = lock(&self.state);
        if let Some(entry) = state.pending.get(key) {
            debug!(key = key, "実行中の処理を共有");
            return entry.promise.clone();
        }

        if cancel_others {
            for (other, entry) in state.pending.drain() {
                debug!(key = %other, "他キーの処理をキャンセル");
                entry.promise.cancel();
            }
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let guard = PendingGuard {
            state: Arc::downgrade(&self.state),
            key: key.to_string(),
            generation,
        };
        // 登録はロック内で完了するため、タスク側の登録解除は必ず登録後に走る
        let promise = Cancelable::new(async move {
            let _guard = guard;
            factory().await
        });
        state.pending.insert(
            key.to_string(),
            Entry {
                generation,
                promise: promise.clone(),
            },
        );
        promise
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state).pending.contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state).pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 実行中のすべての処理をキャンセルする。
    pub fn cancel_all(&self) {
        for (_, entry) in lock(&self.state).pending.drain() {
            entry.promise.cancel();
        }
    }
}

impl<T, E> Default for Singular<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Singular<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// 決着・キャンセル時（future の破棄時）に登録を解除する。
/// 同じキーで新しい世代が登録済みの場合は何もしない。
struct PendingGuard<T, E> {
    state: Weak<Mutex<SingularState<T, E>>>,
    key: String,
    generation: u64,
}

impl<T, E> Drop for PendingGuard<T, E> {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if state
            .pending
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            state.pending.remove(&self.key);
        }
    }
}
