//! 审计日志中的敏感参数遮蔽
//!
//! 三种规则：键名命中敏感词；同一对象中描述字段提到密码等时遮蔽其 text/value；
//! 配置的字面秘密值在任意字符串中出现时替换。

use serde_json::{Map, Value};

pub const MASK: &str = "***";

const PREVIEW_CHARS: usize = 200;

/// 描述被输入元素的字段（如 browser_type 的 element）
const CONTEXT_FIELDS: &[&str] = &["element", "name", "label", "selector", "description", "field"];
/// 被输入的值
const VALUE_FIELDS: &[&str] = &["text", "value", "values"];

#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    keys: Vec<String>,
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new(keys: &[String], values: &[String]) -> Self {
        Self {
            keys: keys.iter().map(|k| k.to_ascii_lowercase()).filter(|k| !k.is_empty()).collect(),
            values: values.iter().filter(|v| !v.is_empty()).cloned().collect(),
        }
    }

    fn is_sensitive_name(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.keys.iter().any(|k| name.contains(k.as_str()))
    }

    pub fn mask(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.mask_object(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask(v)).collect()),
            Value::String(s) => Value::String(self.mask_str(s)),
            other => other.clone(),
        }
    }

    fn mask_object(&self, map: &Map<String, Value>) -> Map<String, Value> {
        let sensitive_context = CONTEXT_FIELDS.iter().any(|field| {
            map.get(*field)
                .and_then(Value::as_str)
                .is_some_and(|s| self.is_sensitive_name(s))
        });

        map.iter()
            .map(|(key, value)| {
                let masked = if self.is_sensitive_name(key)
                    || (sensitive_context && VALUE_FIELDS.contains(&key.as_str()))
                {
                    Value::String(MASK.into())
                } else {
                    self.mask(value)
                };
                (key.clone(), masked)
            })
            .collect()
    }

    pub fn mask_str(&self, s: &str) -> String {
        self.mask_text(s, &[])
    }

    /// 遮蔽自由文本：配置的字面值，以及调用参数中被判定为敏感的值（见 secrets_in）
    pub fn mask_text(&self, s: &str, extra: &[String]) -> String {
        self.values
            .iter()
            .chain(extra)
            .filter(|secret| !secret.is_empty())
            .fold(s.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }

    /// 参数中会被 mask 遮蔽的字符串值（服务端可能在结果或错误文本中回显它们）
    pub fn secrets_in(&self, value: &Value) -> Vec<String> {
        let mut found = Vec::new();
        self.collect_secrets(value, &mut found);
        found
    }

    fn collect_secrets(&self, value: &Value, found: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                let sensitive_context = CONTEXT_FIELDS.iter().any(|field| {
                    map.get(*field)
                        .and_then(Value::as_str)
                        .is_some_and(|s| self.is_sensitive_name(s))
                });
                for (key, v) in map {
                    if self.is_sensitive_name(key) || (sensitive_context && VALUE_FIELDS.contains(&key.as_str())) {
                        collect_strings(v, found);
                    } else {
                        self.collect_secrets(v, found);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| self.collect_secrets(v, found)),
            _ => {}
        }
    }

    /// 遮蔽后的单行预览（截断）
    pub fn preview(&self, args: &Value) -> String {
        let s = self.mask(args).to_string();
        if s.chars().count() > PREVIEW_CHARS {
            format!("{}...", s.chars().take(PREVIEW_CHARS).collect::<String>())
        } else {
            s
        }
    }
}

fn collect_strings(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.is_empty() => found.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn masker() -> SecretMasker {
        SecretMasker::new(
            &["password".into(), "token".into(), "secret".into()],
            &["s3cr3t-literal".into()],
        )
    }

    #[test]
    fn test_masks_sensitive_keys() {
        let masked = masker().mask(&json!({"username": "alice", "password": "hunter2", "nested": {"api_token": "abc"}}));
        assert_eq!(masked["username"], "alice");
        assert_eq!(masked["password"], MASK);
        assert_eq!(masked["nested"]["api_token"], MASK);
    }

    #[test]
    fn test_masks_value_typed_into_password_field() {
        let args = json!({"element": "Password input", "ref": "e12", "text": "hunter2"});
        let masked = masker().mask(&args);
        assert_eq!(masked["text"], MASK);
        assert_eq!(masked["ref"], "e12");

        let args = json!({"element": "Search box", "text": "rust"});
        assert_eq!(masker().mask(&args)["text"], "rust");
    }

    #[test]
    fn test_masks_literal_values_anywhere() {
        let args = json!({"url": "https://example.com/?key=s3cr3t-literal&x=1"});
        let preview = masker().preview(&args);
        assert!(!preview.contains("s3cr3t-literal"));
        assert!(preview.contains("key=***"));
    }

    #[test]
    fn test_secrets_in_arguments_masked_in_text() {
        let m = masker();
        let args = json!({"element": "Password field", "ref": "e3", "text": "hunter2", "token": ["t-1"]});
        let secrets = m.secrets_in(&args);
        assert_eq!(secrets.len(), 2);
        let echoed = "### Ran Playwright code\nawait page.fill('hunter2'); // t-1 s3cr3t-literal";
        let masked = m.mask_text(echoed, &secrets);
        assert!(!masked.contains("hunter2"));
        assert!(!masked.contains("t-1"));
        assert!(!masked.contains("s3cr3t-literal"));
        assert!(masked.contains("page.fill('***')"));
    }

    #[test]
    fn test_preview_truncates() {
        let args = json!({"text": "x".repeat(500)});
        assert!(masker().preview(&args).ends_with("..."));
    }
}
