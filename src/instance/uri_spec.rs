//! URI 模板
//!
//! 模板格式：`{scheme}://{address}:{port}`，花括号中的为变量，其余为字面量。
//! 支持的变量：`scheme`、`name`、`id`、`address`、`port`、`ssl-port`，
//! 其余变量从实例元数据中查找，找不到时原样保留。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ServiceInstance;

/// 默认 URI 模板
pub const DEFAULT_URI_SPEC: &str = "{scheme}://{address}:{port}";

/// 模板片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriPart {
    pub value: String,
    pub variable: bool,
}

/// 解析后的 URI 模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriSpec {
    pub parts: Vec<UriPart>,
}

impl Default for UriSpec {
    fn default() -> Self {
        Self::parse(DEFAULT_URI_SPEC)
    }
}

impl UriSpec {
    /// 解析模板字符串，未闭合的 `{` 按字面量处理
    pub fn parse(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            literal.push_str(&rest[..open]);
            if !literal.is_empty() {
                parts.push(UriPart {
                    value: std::mem::take(&mut literal),
                    variable: false,
                });
            }
            parts.push(UriPart {
                value: rest[open + 1..open + close].to_string(),
                variable: true,
            });
            rest = &rest[open + close + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(UriPart {
                value: literal,
                variable: false,
            });
        }

        Self { parts }
    }

    /// 使用实例字段填充模板
    pub fn build(&self, instance: &ServiceInstance) -> String {
        let mut uri = String::new();
        for part in &self.parts {
            if !part.variable {
                uri.push_str(&part.value);
                continue;
            }
            match part.value.as_str() {
                "scheme" => uri.push_str(if instance.ssl_port.is_some() {
                    "https"
                } else {
                    "http"
                }),
                "name" => uri.push_str(&instance.service_id),
                "id" => uri.push_str(&instance.instance_id),
                "address" => uri.push_str(&instance.host),
                "port" => uri.push_str(&instance.port.to_string()),
                "ssl-port" => {
                    if let Some(ssl_port) = instance.ssl_port {
                        uri.push_str(&ssl_port.to_string());
                    }
                }
                other => match instance.metadata.get(other) {
                    Some(value) => uri.push_str(value),
                    None => {
                        uri.push('{');
                        uri.push_str(other);
                        uri.push('}');
                    }
                },
            }
        }
        uri
    }
}

impl fmt::Display for UriSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            if part.variable {
                write!(f, "{{{}}}", part.value)?;
            } else {
                f.write_str(&part.value)?;
            }
        }
        Ok(())
    }
}
