use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

use crate::lock;

/// キャッシュに保存された決着結果（成功・失敗の別を保持する）。
#[derive(Debug, Clone)]
pub struct CachedOutcome<T, E> {
    pub outcome: Result<T, E>,
    pub stored_at: Instant,
}

impl<T, E> CachedOutcome<T, E> {
    pub fn new(outcome: Result<T, E>) -> Self {
        Self {
            outcome,
            stored_at: Instant::now(),
        }
    }

    /// TTL が未指定であれば常に有効。
    pub fn is_fresh(&self, ttl: Option<Duration>) -> bool {
        ttl.map_or(true, |ttl| self.stored_at.elapsed() <= ttl)
    }
}

/// 決着結果の保存先。
pub trait OutcomeStore<T, E>: Send {
    fn get(&mut self, key: &str) -> Option<CachedOutcome<T, E>>;
    fn put(&mut self, key: String, outcome: CachedOutcome<T, E>);
    fn remove(&mut self, key: &str) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 容量制限なしのストア。エントリは TTL 判定でのみ無効になる。
pub struct UnboundedStore<T, E> {
    entries: HashMap<String, CachedOutcome<T, E>>,
}

impl<T, E> Default for UnboundedStore<T, E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T, E> OutcomeStore<T, E> for UnboundedStore<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    fn get(&mut self, key: &str) -> Option<CachedOutcome<T, E>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, outcome: CachedOutcome<T, E>) {
        self.entries.insert(key, outcome);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 容量上限付きのストア。上限を超えると最も長く参照されていないエントリから破棄する。
pub struct LruStore<T, E> {
    entries: LruCache<String, CachedOutcome<T, E>>,
}

impl<T, E> LruStore<T, E> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }
}

impl<T, E> OutcomeStore<T, E> for LruStore<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    fn get(&mut self, key: &str) -> Option<CachedOutcome<T, E>> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, outcome: CachedOutcome<T, E>) {
        self.entries.put(key, outcome);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.entries.pop(key).is_some()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// 実行時にストアを選べるようにする
impl<T, E> OutcomeStore<T, E> for Box<dyn OutcomeStore<T, E>> {
    fn get(&mut self, key: &str) -> Option<CachedOutcome<T, E>> {
        (**self).get(key)
    }

    fn put(&mut self, key: String, outcome: CachedOutcome<T, E>) {
        (**self).put(key, outcome);
    }

    fn remove(&mut self, key: &str) -> bool {
        (**self).remove(key)
    }

    fn clear(&mut self) {
        (**self).clear();
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// 決着結果を保存するかどうかの判定関数。引数は (結果, キー)。
pub type CachablePredicate<T, E> = Arc<dyn Fn(&Result<T, E>, &str) -> bool + Send + Sync>;

/// 呼び出し単位のキャッシュ方針。
pub struct CachePolicy<T, E> {
    pub predicate: Option<CachablePredicate<T, E>>,
    pub ttl: Option<Duration>,
}

impl<T, E> CachePolicy<T, E> {
    /// 成功のみ保存し、TTL はディスパッチャの既定値を使う。
    pub fn new() -> Self {
        Self {
            predicate: None,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Result<T, E>, &str) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// 失敗も含めてすべての結果を保存する。
    pub fn always(self) -> Self {
        self.with_predicate(|_, _| true)
    }

    fn is_cachable(&self, outcome: &Result<T, E>, key: &str) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(outcome, key),
            None => outcome.is_ok(),
        }
    }
}

impl<T, E> Default for CachePolicy<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for CachePolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            ttl: self.ttl,
        }
    }
}

impl<T, E> fmt::Debug for CachePolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("custom_predicate", &self.predicate.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// 非同期処理の決着結果をキー単位でメモ化するディスパッチャ。
pub struct Cachable<T, E, S = UnboundedStore<T, E>> {
    store: Arc<Mutex<S>>,
    default_ttl: Option<Duration>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Cachable<T, E, UnboundedStore<T, E>>
where
    T: Clone + Send,
    E: Clone + Send,
{
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self::with_store(UnboundedStore::default(), default_ttl)
    }
}

impl<T, E> Cachable<T, E, LruStore<T, E>>
where
    T: Clone + Send,
    E: Clone + Send,
{
    pub fn lru(capacity: NonZeroUsize, default_ttl: Option<Duration>) -> Self {
        Self::with_store(LruStore::new(capacity), default_ttl)
    }
}

impl<T, E, S> Cachable<T, E, S>
where
    T: Clone + Send,
    E: Clone + Send,
    S: OutcomeStore<T, E>,
{
    pub fn with_store(store: S, default_ttl: Option<Duration>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            default_ttl,
            _marker: PhantomData,
        }
    }

    /// 有効なキャッシュがあればそれを再生し、なければ `factory` を実行する。
    ///
    /// 保存の可否に関わらず、呼び出し元には実際の結果をそのまま返す。
    pub async fn dispatch<F, Fut>(
        &self,
        factory: F,
        key: &str,
        policy: &CachePolicy<T, E>,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ttl = policy.ttl.or(self.default_ttl);
        let hit = {
            let mut store = lock(&self.store);
            match store.get(key) {
                Some(cached) if cached.is_fresh(ttl) => Some(cached.outcome),
                Some(_) => {
                    // 期限切れのエントリは参照時に破棄する
                    store.remove(key);
                    debug!(key = key, "期限切れのキャッシュを破棄");
                    None
                }
                None => None,
            }
        };
        if let Some(outcome) = hit {
            debug!(key = key, ok = outcome.is_ok(), "キャッシュヒット");
            return outcome;
        }

        let outcome = factory().await;
        if policy.is_cachable(&outcome, key) {
            lock(&self.store).put(key.to_string(), CachedOutcome::new(outcome.clone()));
        }
        outcome
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.store).remove(key)
    }

    pub fn clear(&self) {
        lock(&self.store).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.store).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.store).is_empty()
    }
}

impl<T, E, S> Clone for Cachable<T, E, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            default_ttl: self.default_ttl,
            _marker: PhantomData,
        }
    }
}
