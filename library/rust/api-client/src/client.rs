use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use fetchkit_promise::{
    timeout_promise, Cachable, CachePolicy, Cancelable, OutcomeStore, Singular, LruStore,
    UnboundedStore,
};
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::casing::{camelize_keys, decamelize_keys};
use crate::config::{ApiClientConfig, ConfigError};
use crate::download::AttachmentSink;
use crate::error::ApiError;
use crate::request::{
    RequestDescriptor, RequestOptions, AUTHORIZATION_HEADER, CONTENT_TYPE_HEADER,
    JSON_CONTENT_TYPE,
};
use crate::response::{attachment_filename, is_json_content_type, ApiResponse, Blob};
use crate::task::{PollDecision, TaskRetryLedger, TaskTicket};
use crate::urls::{append_query, encode_query, is_absolute, join_url};

/// すべての API エラーを受け取るコールバック。
pub type ErrorObserver = Arc<dyn Fn(&ApiError) + Send + Sync>;

type ResponseStore = Box<dyn OutcomeStore<ApiResponse, ApiError>>;

/// 1 回の HTTP 呼び出しの分類結果。
enum Exchange {
    Done(ApiResponse),
    Accepted(Value),
}

struct Inner {
    config: ApiClientConfig,
    http: reqwest::Client,
    access_token: RwLock<Option<String>>,
    observers: Vec<ErrorObserver>,
    sink: Option<Arc<dyn AttachmentSink>>,
    tasks: TaskRetryLedger,
    cache: Cachable<ApiResponse, ApiError, ResponseStore>,
    singular: Singular<ApiResponse, ApiError>,
}

/// HTTP/JSON API クライアント。
///
/// タスクのリトライ回数・キャッシュ・実行中リクエストはインスタンスごとに保持する。
/// clone したハンドルはこれらを共有する。
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

pub struct ApiClientBuilder {
    config: ApiClientConfig,
    observers: Vec<ErrorObserver>,
    sink: Option<Arc<dyn AttachmentSink>>,
    cache_capacity: Option<NonZeroUsize>,
    cache_ttl: Option<Duration>,
}

impl ApiClientBuilder {
    pub fn new(config: ApiClientConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
            sink: None,
            cache_capacity: None,
            cache_ttl: None,
        }
    }

    /// エラーオブザーバーを追加する。登録順にすべて呼ばれる。
    pub fn on_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn attachment_sink(mut self, sink: Arc<dyn AttachmentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// GET キャッシュの容量上限。未指定の場合は上限なし。
    pub fn cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// GET キャッシュの既定 TTL。未指定の場合は無期限。
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<ApiClient, ConfigError> {
        self.config.validate()?;

        let mut http = reqwest::Client::builder().cookie_store(self.config.credentials.sends_cookies());
        if let Some(ms) = self.config.request_timeout_ms {
            http = http.timeout(Duration::from_millis(ms));
        }
        let http = http
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let store: ResponseStore = match self.cache_capacity {
            Some(capacity) => Box::new(LruStore::new(capacity)),
            None => Box::new(UnboundedStore::default()),
        };

        Ok(ApiClient {
            inner: Arc::new(Inner {
                access_token: RwLock::new(self.config.access_token.clone()),
                config: self.config,
                http,
                observers: self.observers,
                sink: self.sink,
                tasks: TaskRetryLedger::new(),
                cache: Cachable::with_store(store, self.cache_ttl),
                singular: Singular::new(),
            }),
        })
    }
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ConfigError> {
        ApiClientBuilder::new(config).build()
    }

    pub fn builder(config: ApiClientConfig) -> ApiClientBuilder {
        ApiClientBuilder::new(config)
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.inner.config
    }

    /// 以降のリクエストに付与するアクセストークンを差し替える。None で送信を止める。
    pub fn set_access_token(&self, token: Option<String>) {
        *self
            .inner
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// payload をクエリ文字列として送る。
    pub async fn get(
        &self,
        url: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let options = match payload {
            Some(query) => options.query(query),
            None => options,
        };
        self.request(Method::GET, url, options).await
    }

    pub async fn post(
        &self,
        url: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, url, with_body(options, payload))
            .await
    }

    pub async fn put(
        &self,
        url: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::PUT, url, with_body(options, payload))
            .await
    }

    pub async fn delete(
        &self,
        url: &str,
        payload: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, url, with_body(options, payload))
            .await
    }

    /// すべての HTTP 呼び出しの共通経路。
    ///
    /// 202 を受け取った場合は完了するかリトライ回数を使い切るまでタスクの状態を問い合わせる。
    /// 失敗はすべてエラーオブザーバーへ配信してから返す。
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let config = &self.inner.config;
        let transform = options.transform_keys.unwrap_or(config.transform_keys);
        let mut wait_timeout = options.task_wait_timeout;
        let mut max_retries = options.task_max_retries;
        let mut descriptor = self.describe(
            method,
            url,
            options.query.as_ref(),
            options.body.as_ref(),
            transform,
        );
        // 途中で破棄やキャンセルをされた場合もリトライ回数の記録を残さない
        let mut polling: Option<TaskGuard<'_>> = None;

        loop {
            let body = match self.exchange(&descriptor, transform).await {
                Ok(Exchange::Done(response)) => return Ok(response),
                Ok(Exchange::Accepted(body)) => body,
                Err(err) => return Err(self.fail(err, &descriptor)),
            };

            let Some(ticket) = TaskTicket::from_accepted_body(&body, config.resolved_task_url())
            else {
                let err = ApiError::decode(
                    StatusCode::ACCEPTED.as_u16(),
                    "202 レスポンスにタスク ID が含まれていません",
                )
                .with_details(body);
                return Err(self.fail(err, &descriptor));
            };

            if polling
                .as_ref()
                .is_some_and(|guard| guard.task_id != ticket.task_id)
            {
                polling = None;
            }
            wait_timeout = ticket.wait_timeout.or(wait_timeout);
            max_retries = ticket.max_retries.or(max_retries);

            let limit = max_retries.unwrap_or(config.task_max_retries);
            match self.inner.tasks.begin_poll(&ticket.task_id, limit) {
                PollDecision::Exhausted => {
                    return Err(self.fail(ApiError::task_timeout(&ticket.task_id), &descriptor));
                }
                PollDecision::Continue { retries_left } => {
                    debug!(
                        task_id = %ticket.task_id,
                        retries_left = retries_left,
                        "タスクの完了を待機します"
                    );
                }
            }
            if polling.is_none() {
                polling = Some(TaskGuard {
                    tasks: &self.inner.tasks,
                    task_id: ticket.task_id.clone(),
                });
            }

            let wait = wait_timeout.unwrap_or_else(|| config.default_task_wait_timeout());
            wait_for(wait).await;

            descriptor = self.describe(Method::GET, &ticket.status_url, None, None, transform);
        }
    }

    /// 成功した GET をキャッシュする。キーは URL と payload の JSON 表現の連結。
    ///
    /// 失敗はキャッシュせず、毎回そのまま返す。
    pub async fn get_cached(
        &self,
        url: &str,
        payload: Option<Value>,
        ttl: Option<Duration>,
    ) -> Result<ApiResponse, ApiError> {
        let key = request_key(url, payload.as_ref());
        let policy = match ttl {
            Some(ttl) => CachePolicy::new().with_ttl(ttl),
            None => CachePolicy::new(),
        };
        let client = self.clone();
        let url = url.to_string();
        self.inner
            .cache
            .dispatch(
                move || async move { client.get(&url, payload, RequestOptions::default()).await },
                &key,
                &policy,
            )
            .await
    }

    /// 同じ URL・payload の GET が実行中であればその結果を共有する。
    ///
    /// `cancel_others` が true の場合、他のキーで実行中の GET をキャンセルする。
    pub fn get_singular(
        &self,
        url: &str,
        payload: Option<Value>,
        cancel_others: bool,
    ) -> Cancelable<ApiResponse, ApiError> {
        let key = request_key(url, payload.as_ref());
        let client = self.clone();
        let url = url.to_string();
        self.inner.singular.dispatch(
            move || async move { client.get(&url, payload, RequestOptions::default()).await },
            &key,
            cancel_others,
        )
    }

    pub fn invalidate_cached(&self, url: &str, payload: Option<&Value>) -> bool {
        self.inner.cache.invalidate(&request_key(url, payload))
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// タスクの残りリトライ回数。ポーリング中でなければ None。
    pub fn task_retries_left(&self, task_id: &str) -> Option<u32> {
        self.inner.tasks.retries_left(task_id)
    }

    /// エラーの唯一の生成点。記述子を添付し、ログ出力とオブザーバーへの配信を行う。
    pub(crate) fn fail(&self, error: ApiError, request: &RequestDescriptor) -> ApiError {
        let error = error.with_request(request.clone());
        warn!(
            code = error.code(),
            code_type = error.code_type().unwrap_or("-"),
            method = %request.method,
            url = %request.url,
            message = %error.message(),
            "API エラー"
        );
        for observer in &self.inner.observers {
            observer(&error);
        }
        error
    }

    fn describe(
        &self,
        method: Method,
        url: &str,
        query: Option<&Value>,
        body: Option<&Value>,
        transform: bool,
    ) -> RequestDescriptor {
        let config = &self.inner.config;
        let mut url = if is_absolute(url) {
            url.to_string()
        } else {
            join_url(&config.base_url, url)
        };

        if let Some(query) = query.filter(|q| !q.is_null()) {
            match outgoing(query.clone(), transform) {
                Value::Object(params) => url = append_query(&url, &encode_query(&params)),
                other => warn!(query = %other, "オブジェクト以外のクエリは送信しません"),
            }
        }

        let mut headers = Vec::new();
        let body = body.filter(|b| !b.is_null()).map(|b| {
            headers.push((
                CONTENT_TYPE_HEADER.to_string(),
                JSON_CONTENT_TYPE.to_string(),
            ));
            outgoing(b.clone(), transform).to_string()
        });

        let token = self
            .inner
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            headers.push((AUTHORIZATION_HEADER.to_string(), token));
        }

        RequestDescriptor {
            method,
            url,
            mode: config.mode,
            credentials: config.credentials,
            headers,
            body,
        }
    }

    async fn exchange(
        &self,
        descriptor: &RequestDescriptor,
        transform: bool,
    ) -> Result<Exchange, ApiError> {
        debug!(method = %descriptor.method, url = %descriptor.url, "API リクエストを送信");

        let mut request = self
            .inner
            .http
            .request(descriptor.method.clone(), &descriptor.url);
        for (name, value) in &descriptor.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &descriptor.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;
        let status = response.status();
        let content_type = header_text(response.headers(), CONTENT_TYPE.as_str());
        let disposition = header_text(response.headers(), CONTENT_DISPOSITION.as_str());
        let data = response
            .bytes()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;

        if status == StatusCode::OK && !is_json_content_type(content_type.as_deref()) {
            let filename = disposition.as_deref().and_then(attachment_filename);
            let blob = Blob {
                content_type,
                filename,
                data,
            };
            self.download(&blob).await;
            return Ok(Exchange::Done(ApiResponse::Blob(blob)));
        }

        if status == StatusCode::ACCEPTED {
            let body = parse_json(status, &data)?;
            return Ok(Exchange::Accepted(incoming(body, transform)));
        }

        if status.is_success() {
            let body = parse_json(status, &data)?;
            return Ok(Exchange::Done(ApiResponse::Json(incoming(body, transform))));
        }

        Err(error_from_body(status, &data, transform))
    }

    async fn download(&self, blob: &Blob) {
        let (Some(filename), Some(sink)) = (&blob.filename, &self.inner.sink) else {
            return;
        };
        match sink.save(filename, blob).await {
            Ok(()) => info!(filename = %filename, bytes = blob.data.len(), "添付ファイルを受信しました"),
            Err(e) => warn!(filename = %filename, error = %e, "添付ファイルの保存に失敗しました"),
        }
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("config", &self.inner.config)
            .field("observers", &self.inner.observers.len())
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

/// ポーリング中のタスクのリトライ回数を、スコープを抜けた時点で解放する。
struct TaskGuard<'a> {
    tasks: &'a TaskRetryLedger,
    task_id: String,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks.complete(&self.task_id);
    }
}

/// `delay` だけ待機する。タイマーが異常終了した場合も同じ時間だけ待つ。
pub(crate) async fn wait_for(delay: Duration) {
    if let Err(e) = timeout_promise(delay).await {
        warn!(error = %e, "待機タイマーが異常終了しました");
        tokio::time::sleep(delay).await;
    }
}

fn with_body(options: RequestOptions, payload: Option<Value>) -> RequestOptions {
    match payload {
        Some(body) => options.body(body),
        None => options,
    }
}

fn request_key(url: &str, payload: Option<&Value>) -> String {
    match payload {
        Some(payload) => format!("{url}{payload}"),
        None => url.to_string(),
    }
}

fn outgoing(value: Value, transform: bool) -> Value {
    if transform {
        decamelize_keys(value)
    } else {
        value
    }
}

fn incoming(value: Value, transform: bool) -> Value {
    if transform {
        camelize_keys(value)
    } else {
        value
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// 空のボディは null として扱う。
fn parse_json(status: StatusCode, data: &Bytes) -> Result<Value, ApiError> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(data).map_err(|e| ApiError::decode(status.as_u16(), e.to_string()))
}

fn reason(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or_default().to_string()
}

/// 2xx 以外のレスポンスから ApiError を組み立てる。
///
/// `{"error": {"code", "message", ...}}` 形式であればその内容を、そうでなければ
/// ステータスコードと理由句を使う。
fn error_from_body(status: StatusCode, data: &Bytes, transform: bool) -> ApiError {
    let status_code = i32::from(status.as_u16());
    let body = match parse_json(status, data) {
        Ok(Value::Null) => return ApiError::http(status_code, reason(status)),
        Ok(body) => incoming(body, transform),
        Err(err) => return err,
    };

    match body.get("error").filter(|e| e.is_object()) {
        Some(error) => {
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(status_code);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| reason(status), str::to_string);
            ApiError::http(code, message).with_details(error.clone())
        }
        None => ApiError::http(status_code, reason(status)).with_details(body),
    }
}
