//! 工具结果压缩：写回对话前截断到固定长度，大型结构化输出只保留关键字段

use serde_json::Value;

/// 页面快照中保留的头部行
const PAGE_HEADER_PREFIXES: &[&str] = &["- Page URL:", "- Page Title:", "Page URL:", "Page Title:"];

/// 按字符截断并注明被截去的长度
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}\n... [truncated {} chars]", kept, total - max_chars)
}

fn summarize_json(value: &Value, max_chars: usize) -> Option<String> {
    let obj = value.as_object()?;
    let url = obj.get("url").and_then(Value::as_str);
    let title = obj.get("title").and_then(Value::as_str);
    if url.is_none() && title.is_none() {
        return None;
    }
    let mut out = String::new();
    if let Some(url) = url {
        out.push_str(&format!("URL: {}\n", url));
    }
    if let Some(title) = title {
        out.push_str(&format!("Title: {}\n", title));
    }
    let content = ["content", "text", "snapshot"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str));
    if let Some(content) = content {
        let budget = max_chars.saturating_sub(out.chars().count()).max(1);
        out.push_str("Content:\n");
        out.push_str(&truncate_chars(content, budget));
    }
    Some(out)
}

fn summarize_snapshot(text: &str, max_chars: usize) -> Option<String> {
    let header: Vec<&str> = text
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            PAGE_HEADER_PREFIXES.iter().any(|p| line.starts_with(p))
        })
        .collect();
    if header.is_empty() {
        return None;
    }
    let mut out = header.join("\n");
    out.push('\n');
    let rest: String = text
        .lines()
        .filter(|line| !header.contains(line))
        .collect::<Vec<_>>()
        .join("\n");
    let budget = max_chars.saturating_sub(out.chars().count()).max(1);
    out.push_str(&truncate_chars(rest.trim(), budget));
    Some(out)
}

/// 压缩单个工具结果；短结果原样返回
pub fn summarize_observation(tool: &str, output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    tracing::debug!(tool, chars = output.chars().count(), max_chars, "summarizing large observation");

    if let Ok(value) = serde_json::from_str::<Value>(output) {
        if let Some(summary) = summarize_json(&value, max_chars) {
            return summary;
        }
    }
    summarize_snapshot(output, max_chars).unwrap_or_else(|| truncate_chars(output, max_chars))
}
