//! Hyperparameter flattening and sanitizing.
//!
//! The tracking server renders every logged parameter in the experiment view, so
//! large nested configs are flattened with `.`, pruned by prefix, truncated, and
//! sent in fixed-size batches.

use serde_json::{Map, Value};

use crate::core::types::Param;

pub const DEFAULT_MAX_VALUE_LEN: usize = 250;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Config sections that are too large to log key by key.
pub const DEFAULT_IGNORED_PREFIXES: [&str; 7] = [
    "hardware",
    "data",
    "dataloader",
    "model",
    "training",
    "diagnostics",
    "metadata.config",
];

/// Rules applied by [`prepare_params`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRules {
    pub ignored_prefixes: Vec<String>,
    pub max_value_len: usize,
}

impl Default for ParamRules {
    fn default() -> Self {
        Self {
            ignored_prefixes: DEFAULT_IGNORED_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

/// Flatten nested objects into `(dotted.key, value)` pairs, in key order.
///
/// Arrays and scalars are leaves. Empty objects have no leaves and produce no
/// keys.
pub fn flatten(value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    match value {
        Value::Object(map) => flatten_into(map, None, &mut out),
        other => out.push((String::new(), other.clone())),
    }
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: Option<&str>, out: &mut Vec<(String, Value)>) {
    for (key, value) in map {
        let full_key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(inner, Some(&full_key), out),
            _ => out.push((full_key, value.clone())),
        }
    }
}

/// Render a leaf the way the Python tooling around the tracking server prints
/// it: strings unquoted, `True`/`False`/`None`, lists as `[1, 'a']`.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => repr(other),
    }
}

fn repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(key, value)| format!("{}: {}", quote(key), repr(value)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\");
    if escaped.contains('\'') && !escaped.contains('"') {
        format!("\"{escaped}\"")
    } else {
        format!("'{}'", escaped.replace('\'', "\\'"))
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

fn is_ignored(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()))
}

/// Flatten, prune, and truncate a parameter tree into loggable params.
pub fn prepare_params(params: &Value, rules: &ParamRules) -> Vec<Param> {
    flatten(params)
        .into_iter()
        .filter(|(key, _)| !key.is_empty() && !is_ignored(key, &rules.ignored_prefixes))
        .map(|(key, value)| {
            let rendered = stringify(&value);
            Param {
                key,
                value: truncate_chars(&rendered, rules.max_value_len).to_string(),
            }
        })
        .collect()
}
