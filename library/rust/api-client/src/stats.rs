//! 一覧表示などで、オブジェクトごとの集計値をサーバー側の準備完了まで繰り返し取得する。

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::casing::camelize_keys;
use crate::client::{wait_for, ApiClient};
use crate::error::ApiError;
use crate::request::RequestOptions;

type StatsFetcher = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<Value, ApiError>> + Send + Sync>;

/// 集計値の取得元。どちらも `{id: stats}` 形式のオブジェクトを返す。
#[derive(Clone)]
pub enum StatsSource {
    /// `GET {url}?ids=a,b,c` を送る。
    Url(String),
    Custom(StatsFetcher),
}

impl StatsSource {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }

    pub fn custom<F, Fut>(fetch: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        Self::Custom(Arc::new(move |ids| fetch(ids).boxed()))
    }
}

impl fmt::Debug for StatsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ApiClient {
    /// `ids` の集計値が揃うまで取得元へ問い合わせる。
    ///
    /// 取得できた ID ごとに `callback(id, Ok(stats))` を呼ぶ。`stats_max_retries` 回の問い合わせで
    /// 揃わなかった ID には `callback(id, Err(..))`（コード 600）を呼ぶ。
    /// 取得元のリクエスト自体が失敗した場合はその時点で中断し、エラーを返す。
    pub async fn fetch_async_stats<C>(
        &self,
        ids: Vec<String>,
        source: &StatsSource,
        mut callback: C,
        first_fetch_wait: bool,
    ) -> Result<(), ApiError>
    where
        C: FnMut(&str, Result<Value, ApiError>),
    {
        if ids.is_empty() {
            return Ok(());
        }
        let config = self.config();
        let wait = config.resolved_stats_wait_timeout();
        let mut retries_left = config.resolved_stats_max_retries();
        let mut pending = ids;

        if first_fetch_wait {
            wait_for(wait).await;
        }

        loop {
            let stats = self.query_stats(source, pending.clone()).await?;
            let received: HashSet<String> = match stats {
                Value::Object(map) => map
                    .into_iter()
                    .map(|(id, stats)| {
                        callback(&id, Ok(stats));
                        id
                    })
                    .collect(),
                _ => HashSet::new(),
            };
            pending.retain(|id| !received.contains(id));

            retries_left = retries_left.saturating_sub(1);
            if retries_left == 0 || pending.is_empty() {
                break;
            }
            debug!(
                pending = pending.len(),
                retries_left = retries_left,
                "集計値の再取得を待機します"
            );
            wait_for(wait).await;
        }

        for id in pending {
            callback(&id, Err(ApiError::stats_timeout(id.as_str())));
        }
        Ok(())
    }

    /// 取得済みの `known` を先に通知し、残りの ID だけを [`Self::fetch_async_stats`] で取得する。
    pub async fn fetch_async_stats_for<C>(
        &self,
        ids: Vec<String>,
        known: &Map<String, Value>,
        source: &StatsSource,
        mut callback: C,
        first_fetch_wait: bool,
    ) -> Result<(), ApiError>
    where
        C: FnMut(&str, Result<Value, ApiError>),
    {
        for (id, stats) in known {
            callback(id, Ok(stats.clone()));
        }
        let missing = ids
            .into_iter()
            .filter(|id| !known.contains_key(id))
            .collect();
        self.fetch_async_stats(missing, source, callback, first_fetch_wait)
            .await
    }

    async fn query_stats(&self, source: &StatsSource, ids: Vec<String>) -> Result<Value, ApiError> {
        match source {
            StatsSource::Url(url) => {
                // ID をキーとするため、キー名の変換は各集計値の内側だけに適用する
                let response = self
                    .get(
                        url,
                        Some(json!({"ids": ids.join(",")})),
                        RequestOptions::default().transform_keys(false),
                    )
                    .await?;
                let stats = match response.into_json() {
                    Some(Value::Object(map)) if self.config().transform_keys => Value::Object(
                        map.into_iter()
                            .map(|(id, stats)| (id, camelize_keys(stats)))
                            .collect(),
                    ),
                    Some(other) => other,
                    None => Value::Null,
                };
                Ok(stats)
            }
            StatsSource::Custom(fetch) => fetch(ids).await,
        }
    }
}
