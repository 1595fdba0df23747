//! 扁平化配置快照
//!
//! 将嵌套配置展开为 `a.b.c = value` 形式的只读键值视图。
//! 前缀匹配采用宽松规则：按段比较，忽略大小写以及 `-`、`_`。

use std::collections::BTreeMap;

use serde_json::Value;

/// 只读配置快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    entries: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 展开 JSON 树，数组下标记为 `key[0]`，null 跳过
    pub fn from_json(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        flatten(value, String::new(), &mut entries);
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 取 `prefix.` 之下的子属性，键中去掉前缀
    pub fn sub_properties(&self, prefix: &str) -> BTreeMap<String, String> {
        let prefix_segments: Vec<String> = prefix
            .split('.')
            .filter(|s| !s.is_empty())
            .map(normalize)
            .collect();

        self.entries
            .iter()
            .filter_map(|(key, value)| {
                strip_relaxed_prefix(key, &prefix_segments).map(|rest| (rest, value.clone()))
            })
            .collect()
    }

    /// 以子属性构造新的快照
    pub fn namespace(&self, prefix: &str) -> ConfigSnapshot {
        Self {
            entries: self.sub_properties(prefix),
        }
    }
}

fn normalize(segment: &str) -> String {
    segment
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn strip_relaxed_prefix(key: &str, prefix: &[String]) -> Option<String> {
    let mut segments = key.split('.');
    for expected in prefix {
        let segment = segments.next()?;
        if normalize(segment) != *expected {
            return None;
        }
    }
    let rest: Vec<&str> = segments.collect();
    if rest.is_empty() {
        return None;
    }
    Some(rest.join("."))
}

fn flatten(value: &Value, key: String, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (child, nested) in map {
                let child_key = if key.is_empty() {
                    child.clone()
                } else {
                    format!("{key}.{child}")
                };
                flatten(nested, child_key, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten(nested, format!("{key}[{index}]"), out);
            }
        }
        Value::String(s) => {
            out.insert(key, s.clone());
        }
        other => {
            out.insert(key, other.to_string());
        }
    }
}
