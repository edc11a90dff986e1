use thiserror::Error;

/// Cancelable が失敗として決着した理由。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError<E> {
    /// cancel() により中断された。表示は固定の "cancel"。
    #[error("cancel")]
    Canceled,
    /// ラップした処理自体が失敗した。
    #[error("{0}")]
    Rejected(E),
    /// 実行タスクが panic で異常終了した。
    #[error("タスクが異常終了しました: {0}")]
    Aborted(String),
}

impl<E> PromiseError<E> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Rejected の中身を取り出す。Canceled / Aborted の場合は None。
    pub fn into_rejected(self) -> Option<E> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }
}
