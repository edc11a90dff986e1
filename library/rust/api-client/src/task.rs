use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::urls::join_url;

/// 202 レスポンスのボディから読み取った遅延タスクの情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTicket {
    pub task_id: String,
    /// 状態確認に使う URL。
    pub status_url: String,
    pub wait_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl TaskTicket {
    /// 202 ボディを解釈する。タスク ID と URL のどちらも得られなければ None。
    ///
    /// キー名は camelCase・snake_case のどちらでも受け付ける。
    pub fn from_accepted_body(body: &Value, task_url: &str) -> Option<Self> {
        let task_id = field(body, "taskId", "task_id").and_then(id_text);
        let explicit_url = field(body, "taskUrl", "task_url")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (task_id, status_url) = match (task_id, explicit_url) {
            (Some(id), Some(url)) => (id, url),
            (Some(id), None) => {
                let url = join_url(task_url, &id);
                (id, url)
            }
            // ID がない場合は URL 自体をリトライ回数の管理キーとする
            (None, Some(url)) => (url.clone(), url),
            (None, None) => return None,
        };

        Some(Self {
            task_id,
            status_url,
            wait_timeout: field(body, "waitTimeout", "wait_timeout")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
            max_retries: field(body, "maxRetries", "max_retries")
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        })
    }
}

fn field<'a>(body: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    body.get(camel)
        .or_else(|| body.get(snake))
        .filter(|v| !v.is_null())
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// 待機後に再度問い合わせる。
    Continue { retries_left: u32 },
    /// リトライ回数を使い切った。記録は削除済み。
    Exhausted,
}

/// タスク ID ごとの残りリトライ回数。
///
/// 値は常に `0..=max_retries` の範囲に収まり、0 に達した記録は次の問い合わせで削除される。
/// ポーリングしていたリクエストが完了・失敗・キャンセルのいずれかで終わった時点でも削除される。
#[derive(Debug, Default)]
pub struct TaskRetryLedger {
    retries: Mutex<HashMap<String, u32>>,
}

impl TaskRetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 問い合わせの前に呼ぶ。初回は `max_retries` で記録を作る。
    pub fn begin_poll(&self, task_id: &str, max_retries: u32) -> PollDecision {
        let mut retries = self.lock();
        let left = retries.entry(task_id.to_string()).or_insert(max_retries);
        if *left == 0 {
            retries.remove(task_id);
            return PollDecision::Exhausted;
        }
        *left -= 1;
        PollDecision::Continue {
            retries_left: *left,
        }
    }

    /// タスクが完了（成功・失敗を問わない）した時点で記録を削除する。
    pub fn complete(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    pub fn retries_left(&self, task_id: &str) -> Option<u32> {
        self.lock().get(task_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.retries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
