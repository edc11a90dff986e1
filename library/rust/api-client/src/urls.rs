use serde_json::{Map, Value};

/// `http://` または `https://` で始まる URL かどうか。
pub fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// 区切りのスラッシュがちょうど一つになるように連結する。
pub fn join_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) if !base.is_empty() && !path.is_empty() => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// 複数の URL 断片を順に連結する。
pub fn join_urls<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    parts.into_iter().fold(String::new(), |acc, part| {
        if acc.is_empty() {
            part.to_string()
        } else {
            join_url(&acc, part)
        }
    })
}

/// JSON オブジェクトをクエリ文字列へエンコードする。null の値は含めない。
pub fn encode_query(params: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        if let Some(value) = query_value(value) {
            serializer.append_pair(key, &value);
        }
    }
    serializer.finish()
}

/// URL にクエリ文字列を付与する。既存のクエリがあれば `&` で繋ぐ。
pub fn append_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Array(items) => Some(
            items
                .iter()
                .map(|item| scalar_text(item).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        // ネストしたオブジェクトは JSON 文字列として送る
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
