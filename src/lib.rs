//! Scout - 自主 Web 探索与测试生成智能体
//!
//! 模块划分：
//! - **agent**: Agent 运行时（共享调度器与自动化连接，按任务执行运行）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、运行阶段、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: 浏览器自动化协议客户端（JSON-RPC over stdio）与共享连接
//! - **memory**: 单次运行的对话历史
//! - **observability**: 日志初始化
//! - **rate_limit**: token 估算、滑动窗口预算、单飞请求调度
//! - **react**: Planner、控制循环、观察压缩、导航与模态框策略
//! - **tools**: 工具目录、执行网关、本地工具（测试文件读写、运行测试）与参数脱敏

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod rate_limit;
pub mod react;
pub mod tools;

pub use agent::AgentRuntime;
pub use react::RunResult;
