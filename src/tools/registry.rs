//! 工具目录
//!
//! 本地工具实现 Tool trait；远程工具来自自动化服务端的 tools/list。
//! ToolCatalog 在启动时把名称解析为 ToolRoute（本地优先，同名远程工具被遮蔽），循环内不再做字符串分派。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::core::AgentError;
use crate::llm::ToolDefinition;
use crate::mcp::McpToolDefinition;

/// 本地工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// 覆盖网关的默认单次超时（如测试运行器）
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError>;
}

/// 由参数结构体生成 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 把工具参数反序列化为结构体，失败视为非法输入（可恢复，报告给 LLM）
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, AgentError> {
    serde_json::from_value(args)
        .map_err(|e| AgentError::invalid_input(format!("Invalid arguments for {}: {}", tool, e)))
}

/// 工具路由
#[derive(Clone)]
pub enum ToolRoute {
    Local(Arc<dyn Tool>),
    Remote,
}

impl ToolRoute {
    pub fn is_remote(&self) -> bool {
        matches!(self, ToolRoute::Remote)
    }
}

/// 名称 → 路由 + 定义；definitions 保持注册顺序（本地在前）
#[derive(Default)]
pub struct ToolCatalog {
    routes: HashMap<String, ToolRoute>,
    definitions: Vec<ToolDefinition>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_local(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let definition = ToolDefinition {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
        };
        self.definitions.retain(|d| d.name != name);
        self.definitions.push(definition);
        self.routes.insert(name, ToolRoute::Local(tool));
    }

    /// 替换全部远程工具（重新初始化时调用）
    pub fn set_remote(&mut self, tools: Vec<McpToolDefinition>) -> usize {
        self.routes.retain(|_, route| !route.is_remote());
        let routes = &self.routes;
        self.definitions.retain(|d| routes.contains_key(&d.name));

        let mut added = 0;
        for tool in tools {
            if self.routes.contains_key(&tool.name) {
                warn!(tool = %tool.name, "remote tool shadowed by local tool");
                continue;
            }
            self.definitions.push(ToolDefinition {
                name: tool.name.clone(),
                description: tool.description,
                parameters: tool.input_schema,
            });
            self.routes.insert(tool.name, ToolRoute::Remote);
            added += 1;
        }
        added
    }

    pub fn resolve(&self, name: &str) -> Option<ToolRoute> {
        self.routes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn is_remote(&self, name: &str) -> bool {
        self.routes.get(name).is_some_and(ToolRoute::is_remote)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn remote_count(&self) -> usize {
        self.routes.values().filter(|r| r.is_remote()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "local"
        }
        async fn execute(&self, _args: Value) -> Result<String, AgentError> {
            Ok(self.0.to_string())
        }
    }

    fn remote(name: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.into(),
            description: "remote".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn test_local_shadows_remote() {
        let mut catalog = ToolCatalog::new();
        catalog.register_local(Arc::new(Named("write_test_file")));
        let added = catalog.set_remote(vec![remote("write_test_file"), remote("browser_click")]);

        assert_eq!(added, 1);
        assert!(!catalog.is_remote("write_test_file"));
        assert!(catalog.is_remote("browser_click"));
        let names: Vec<_> = catalog.definitions().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["write_test_file", "browser_click"]);
    }

    #[test]
    fn test_set_remote_replaces_previous_list() {
        let mut catalog = ToolCatalog::new();
        catalog.register_local(Arc::new(Named("list_test_files")));
        catalog.set_remote(vec![remote("browser_click"), remote("browser_close")]);
        catalog.set_remote(vec![remote("browser_navigate")]);

        assert!(!catalog.contains("browser_click"));
        assert!(catalog.contains("browser_navigate"));
        assert!(catalog.contains("list_test_files"));
        assert_eq!(catalog.remote_count(), 1);
        assert_eq!(catalog.definitions().len(), 2);
    }

    #[test]
    fn test_parse_args_reports_invalid_input() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Args {
            path: String,
        }
        let err = parse_args::<Args>("read_test_file", serde_json::json!({})).err().unwrap();
        assert_eq!(err.code, crate::core::ErrorCode::InvalidInput);
        assert!(err.recoverable);
    }
}
