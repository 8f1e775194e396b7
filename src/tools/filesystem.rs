//! 沙箱文件系统工具
//!
//! SafeFs 绑定产物目录，所有路径先做词法归一化（禁止绝对路径与 ../ 逃逸），
//! 已存在的路径再 canonicalize 复核，防止符号链接跳出沙箱。
//! WriteTestFileTool / ReadTestFileTool / ListTestFilesTool 基于 SafeFs。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::AgentError;
use crate::tools::{parse_args, schema_of, Tool};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
    max_bytes: usize,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>, max_bytes: usize) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法归一化后拼到根目录下；越界即 path_escape
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(AgentError::invalid_input("Path must not be empty"));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(AgentError::path_escape(path));
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(AgentError::path_escape(path)),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(AgentError::invalid_input(format!("Path does not name a file: {}", path)));
        }

        let full = self.root_dir.join(&normalized);
        if let (Ok(canonical), Ok(root)) = (full.canonicalize(), self.root_dir.canonicalize()) {
            if !canonical.starts_with(root) {
                return Err(AgentError::path_escape(path)); // 符号链接指向沙箱外
            }
        }
        Ok(full)
    }

    fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root_dir)
            .unwrap_or(full)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<WrittenFile, AgentError> {
        if content.len() > self.max_bytes {
            return Err(AgentError::invalid_input(format!(
                "Content too large: {} bytes (limit {})",
                content.len(),
                self.max_bytes
            )));
        }
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::tool_failed(format!("Create directory failed: {}", e)))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| AgentError::tool_failed(format!("Write failed: {}", e)))?;
        Ok(WrittenFile {
            path: self.relative(&full),
            size: content.len() as u64,
        })
    }

    pub async fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| AgentError::tool_failed(format!("Read failed: {}", e)))
    }

    /// 沙箱内所有文件（相对路径，排序）；目录不存在时为空
    pub fn list_files(&self) -> Result<Vec<String>, AgentError> {
        if !self.root_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root_dir).follow_links(false) {
            let entry = entry.map_err(|e| AgentError::tool_failed(format!("List failed: {}", e)))?;
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if entry.file_type().is_file() && !hidden {
                files.push(self.relative(entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteTestFileArgs {
    /// 相对产物目录的路径，如 login.spec.ts
    pub path: String,
    /// 完整文件内容
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadTestFileArgs {
    /// 相对产物目录的路径
    pub path: String,
}

/// 写入生成的测试文件
pub struct WriteTestFileTool {
    fs: SafeFs,
}

impl WriteTestFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteTestFileTool {
    fn name(&self) -> &str {
        "write_test_file"
    }

    fn description(&self) -> &str {
        "Write a generated test file into the test artifacts directory. Returns {path, size}."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteTestFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let args: WriteTestFileArgs = parse_args(self.name(), args)?;
        tracing::info!(path = %args.path, bytes = args.content.len(), "write_test_file");
        let written = self.fs.write_file(&args.path, &args.content).await?;
        serde_json::to_string(&written).map_err(|e| AgentError::tool_failed(e.to_string()))
    }
}

/// 读取已生成的测试文件
pub struct ReadTestFileTool {
    fs: SafeFs,
}

impl ReadTestFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadTestFileTool {
    fn name(&self) -> &str {
        "read_test_file"
    }

    fn description(&self) -> &str {
        "Read a previously generated test file from the test artifacts directory."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ReadTestFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let args: ReadTestFileArgs = parse_args(self.name(), args)?;
        self.fs.read_file(&args.path).await
    }
}

/// 列出已生成的测试文件
pub struct ListTestFilesTool {
    fs: SafeFs,
}

impl ListTestFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListTestFilesTool {
    fn name(&self) -> &str {
        "list_test_files"
    }

    fn description(&self) -> &str {
        "List all generated test files (paths relative to the test artifacts directory)."
    }

    async fn execute(&self, _args: Value) -> Result<String, AgentError> {
        let files = self.fs.list_files()?;
        Ok(serde_json::json!({ "files": files }).to_string())
    }
}
