use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// fetch の mode に相当する設定。ネイティブクライアントでは記述子に記録するのみ。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// fetch の credentials に相当する設定。omit 以外ではクッキーストアを有効にする。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

impl CredentialsMode {
    pub fn sends_cookies(self) -> bool {
        !matches!(self, Self::Omit)
    }
}

fn default_task_wait_timeout_ms() -> u64 {
    1000
}

fn default_task_max_retries() -> u32 {
    10
}

fn default_transform_keys() -> bool {
    true
}

/// ApiClient の設定。未知のキーはパース時にエラーとする。
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiClientConfig {
    pub base_url: String,
    #[serde(default)]
    pub mode: RequestMode,
    #[serde(default)]
    pub credentials: CredentialsMode,
    /// タスク状態確認 URL の接頭辞。未指定の場合は base_url。
    #[serde(default)]
    pub task_url: Option<String>,
    #[serde(default = "default_task_wait_timeout_ms")]
    pub task_wait_timeout_ms: u64,
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,
    /// 未指定の場合は task_wait_timeout_ms。
    #[serde(default)]
    pub stats_wait_timeout_ms: Option<u64>,
    /// 未指定の場合は task_max_retries。
    #[serde(default)]
    pub stats_max_retries: Option<u32>,
    #[serde(default = "default_transform_keys")]
    pub transform_keys: bool,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

// 文字列として扱うキー。prefixed vars の値を YAML スカラーとして解釈しない。
const STRING_KEYS: &[&str] = &["base_url", "task_url", "access_token", "mode", "credentials"];

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            mode: RequestMode::default(),
            credentials: CredentialsMode::default(),
            task_url: None,
            task_wait_timeout_ms: default_task_wait_timeout_ms(),
            task_max_retries: default_task_max_retries(),
            stats_wait_timeout_ms: None,
            stats_max_retries: None,
            transform_keys: default_transform_keys(),
            access_token: None,
            request_timeout_ms: None,
        }
    }

    /// YAML ファイルを読み込み、バリデーション済みの設定を返す。
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `PREFIX_BASE_URL=...` 形式のキーと値の組から設定を組み立てる。
    ///
    /// 接頭辞に一致しないキーは無視し、接頭辞に一致するが未知のキーはエラーとする。
    pub fn from_prefixed_vars<I, K, V>(prefix: &str, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(prefix) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            let raw: String = value.into();
            let value = if STRING_KEYS.contains(&name.as_str()) {
                serde_yaml::Value::String(raw)
            } else {
                match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
                    Ok(v @ (serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_))) => v,
                    _ => serde_yaml::Value::String(raw),
                }
            };
            mapping.insert(serde_yaml::Value::String(name), value);
        }
        let config: Self = serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定値のバリデーション。
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("base_url", &self.base_url)?;
        if let Some(task_url) = &self.task_url {
            validate_http_url("task_url", task_url)?;
        }
        if self.task_max_retries == 0 {
            return Err(ConfigError::Validation(
                "task_max_retries must be > 0".into(),
            ));
        }
        if self.stats_max_retries == Some(0) {
            return Err(ConfigError::Validation(
                "stats_max_retries must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn task_url(mut self, task_url: impl Into<String>) -> Self {
        self.task_url = Some(task_url.into());
        self
    }

    pub fn task_wait_timeout(mut self, timeout: Duration) -> Self {
        self.task_wait_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn task_max_retries(mut self, retries: u32) -> Self {
        self.task_max_retries = retries;
        self
    }

    pub fn stats_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stats_wait_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn stats_max_retries(mut self, retries: u32) -> Self {
        self.stats_max_retries = Some(retries);
        self
    }

    pub fn transform_keys(mut self, enabled: bool) -> Self {
        self.transform_keys = enabled;
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn resolved_task_url(&self) -> &str {
        self.task_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn default_task_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.task_wait_timeout_ms)
    }

    pub fn resolved_stats_wait_timeout(&self) -> Duration {
        Duration::from_millis(
            self.stats_wait_timeout_ms
                .unwrap_or(self.task_wait_timeout_ms),
        )
    }

    pub fn resolved_stats_max_retries(&self) -> u32 {
        self.stats_max_retries.unwrap_or(self.task_max_retries)
    }
}

impl fmt::Debug for ApiClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClientConfig")
            .field("base_url", &self.base_url)
            .field("mode", &self.mode)
            .field("credentials", &self.credentials)
            .field("task_url", &self.task_url)
            .field("task_wait_timeout_ms", &self.task_wait_timeout_ms)
            .field("task_max_retries", &self.task_max_retries)
            .field("stats_wait_timeout_ms", &self.stats_wait_timeout_ms)
            .field("stats_max_retries", &self.stats_max_retries)
            .field("transform_keys", &self.transform_keys)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{field} is required")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "{field} must use http or https"
        )));
    }
    Ok(())
}
