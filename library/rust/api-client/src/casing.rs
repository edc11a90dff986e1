//! API 境界でのキー名変換（アプリ側 camelCase ⇄ ワイヤ側 snake_case）。

use std::sync::LazyLock;

use heck::{ToLowerCamelCase, ToSnakeCase};
use regex::Regex;
use serde_json::Value;

// 定数風のキー（例: `ID`, `HTTP_200`）は変換しない
static CONSTANT_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+$").expect("定数キーの正規表現が不正"));

/// オブジェクトのキーを再帰的に camelCase へ変換する。
pub fn camelize_keys(value: Value) -> Value {
    transform_keys(value, &|key: &str| key.to_lower_camel_case())
}

/// オブジェクトのキーを再帰的に snake_case へ変換する。
pub fn decamelize_keys(value: Value) -> Value {
    transform_keys(value, &|key: &str| key.to_snake_case())
}

fn transform_keys(value: Value, convert: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (convert_key(&key, convert), transform_keys(value, convert)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| transform_keys(item, convert))
                .collect(),
        ),
        other => other,
    }
}

fn convert_key(key: &str, convert: &dyn Fn(&str) -> String) -> String {
    if CONSTANT_KEY.is_match(key) {
        key.to_string()
    } else {
        convert(key)
    }
}
