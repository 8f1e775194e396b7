//! Scout 命令行入口
//!
//! `scout [--config <file>] <task...>`：执行一次运行，过程事件逐条打印，最终 RunResult 以 JSON 打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use scout::config::load_config;
use scout::core::{AutomationCleanup, ShutdownCoordinator, ShutdownManager};
use scout::react::{LogEvent, LogKind};
use scout::{observability, AgentRuntime};
use tokio::sync::mpsc;

struct CliArgs {
    config_path: Option<PathBuf>,
    task: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config_path = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().context("--config requires a file path")?;
                config_path = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("usage: scout [--config <file>] <task...>");
                std::process::exit(0);
            }
            _ => words.push(arg),
        }
    }
    let task = words.join(" ");
    if task.trim().is_empty() {
        bail!("usage: scout [--config <file>] <task...>");
    }
    Ok(CliArgs { config_path, task })
}

fn print_event(event: &LogEvent) {
    let tag = match event.kind {
        LogKind::Info => "info",
        LogKind::Success => " ok ",
        LogKind::Warning => "warn",
        LogKind::Error => "fail",
        LogKind::Agent => "agent",
    };
    println!("[{}] [{}] {}", event.timestamp.format("%H:%M:%S"), tag, event.message);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = parse_args()?;

    let config = load_config(args.config_path.as_deref()).context("Failed to load config")?;
    let runtime = AgentRuntime::from_config(config)
        .context("Failed to build agent runtime")?
        .with_config_path(args.config_path.as_deref());

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let (tx, mut rx) = mpsc::unbounded_channel::<LogEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = runtime.run(&args.task, Some(tx), shutdown.run_token()).await;
    let _ = printer.await;
    if let Some(reason) = shutdown.reason() {
        tracing::warn!(?reason, "run interrupted by signal");
    }

    let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(10));
    coordinator.register(AutomationCleanup::new(Arc::clone(runtime.gateway())));
    coordinator.run_cleanup().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
