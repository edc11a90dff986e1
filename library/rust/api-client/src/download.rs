use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::response::Blob;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("ファイルの書き込みに失敗しました: {0}")]
    Io(#[from] std::io::Error),
    #[error("不正なファイル名です: {0}")]
    InvalidFilename(String),
}

/// attachment として受け取ったレスポンスの保存先。
#[async_trait]
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait AttachmentSink: Send + Sync {
    async fn save(&self, filename: &str, blob: &Blob) -> Result<(), DownloadError>;
}

/// 指定ディレクトリへファイルとして書き出す。
#[derive(Debug, Clone)]
pub struct FsAttachmentSink {
    dir: PathBuf,
}

impl FsAttachmentSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 保存先のパス。ディレクトリ成分は取り除き、ファイル名部分のみを使う。
    pub fn target_path(&self, filename: &str) -> Result<PathBuf, DownloadError> {
        let name = Path::new(filename)
            .file_name()
            .ok_or_else(|| DownloadError::InvalidFilename(filename.to_string()))?;
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl AttachmentSink for FsAttachmentSink {
    async fn save(&self, filename: &str, blob: &Blob) -> Result<(), DownloadError> {
        let path = self.target_path(filename)?;
        tokio::fs::write(&path, &blob.data).await?;
        info!(path = %path.display(), bytes = blob.data.len(), "添付ファイルを保存しました");
        Ok(())
    }
}

/// 保存内容をメモリに保持する。
#[derive(Debug, Default)]
pub struct MemoryAttachmentSink {
    saved: Mutex<Vec<(String, Blob)>>,
}

impl MemoryAttachmentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<(String, Blob)> {
        self.saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AttachmentSink for MemoryAttachmentSink {
    async fn save(&self, filename: &str, blob: &Blob) -> Result<(), DownloadError> {
        self.saved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((filename.to_string(), blob.clone()));
        Ok(())
    }
}
