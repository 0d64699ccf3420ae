//! taskpilot 命令行
//!
//! 用法：taskpilot [--config <file>] <query...>（--help 查看全部参数）
//! 提交一次查询，轮询会话快照打印每一步进度，直到会话进入终态；退出前终止工具进程。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use taskpilot::core::{create_agent_builder, SessionStatus, StepStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "taskpilot")]
#[command(about = "Run a query through the tool-using agent loop", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// The query to solve
    #[arg(required = true, num_args = 1..)]
    query: Vec<String>,
}

impl Cli {
    fn query_text(&self) -> String {
        self.query.join(" ")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskpilot::observability::init();

    let cli = Cli::parse();
    let query = cli.query_text();
    let components = create_agent_builder(cli.config).build();
    let orchestrator = components.orchestrator.clone();

    let task = orchestrator.start(&query);
    let id = task.id.clone();

    let supervisor = orchestrator.supervisor().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, cancelling session...");
            supervisor.cancel_all();
        }
    });

    let mut printed = 0usize;
    let session = loop {
        let session = orchestrator
            .registry()
            .get(&id)
            .context("session disappeared from registry")?;
        for (index, step) in session.steps.iter().skip(printed) {
            // 只打印已结束的步骤，Running 占位下次再看
            if step.status == StepStatus::Running {
                break;
            }
            println!("[{}] {}({}) -> {}", index, step.tool, step.args, step.result);
            printed += 1;
        }
        if session.status.is_terminal() {
            break session;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    let _ = task.join.await;

    let (prompt_tokens, completion_tokens, total_tokens) = components.llm.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "LLM token usage");

    if let Some(server) = &components.tool_server {
        server.terminate().await;
    }

    match session.status {
        SessionStatus::Completed => {
            println!("{}", session.final_answer.unwrap_or_default());
            Ok(())
        }
        _ => bail!(
            "session failed: {}",
            session.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}
