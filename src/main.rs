use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use call_copilot::agent::{AgentOutcome, CallAgent};
use call_copilot::config::{CopilotConfig, DEFAULT_CONFIG_PATH};
use call_copilot::error::{ConfigError, CopilotError, Result};
use call_copilot::intent::{DetectionMode, IntentDetector};
use call_copilot::llm::config::ModelRegistry;
use call_copilot::llm::{DefaultLlmClient, LlmClient};
use call_copilot::mcp::{DefaultTransportFactory, NewServer, TransportConfig};
use call_copilot::orchestrator::{ConnectionOrchestrator, ToolExecutor};
use call_copilot::store::FileStore;
use call_copilot::tools::ToolAggregator;
use call_copilot::transcript::{TranscriptSegment, parse_line};
use clap::{Parser, Subcommand, ValueEnum};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "call-copilot")]
#[command(about = "MCP tool servers + live-call tool-calling agent", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML 配置文件
    #[arg(long, env = "COPILOT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// 覆盖配置中的 store_path
    #[arg(long)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 列出已保存的服务端
    Servers,
    /// 添加 stdio 服务端：`add-stdio --name fs -- npx -y @modelcontextprotocol/server-filesystem /tmp`
    AddStdio {
        #[arg(short, long)]
        name: String,
        /// KEY=VALUE，可重复
        #[arg(short, long = "env")]
        env: Vec<String>,
        #[arg(long)]
        auto_connect: bool,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// 添加 HTTP 服务端
    AddHttp {
        #[arg(short, long)]
        name: String,
        /// `Name: value`，可重复
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        auto_connect: bool,
        url: String,
    },
    Remove {
        id: String,
    },
    /// 导入 `{"mcpServers": {...}}` 格式的 JSON 文件
    Import {
        file: PathBuf,
    },
    /// 测试连接，不改变保存的状态
    Test {
        id: String,
    },
    /// 连接并列出发现的工具
    Connect {
        id: String,
    },
    /// 连接所有启用的服务端并列出（或搜索）工具
    Tools {
        query: Option<String>,
    },
    /// 调用工具：`call crm:search_contacts '{"query":"Acme"}'`
    Call {
        tool: String,
        #[arg(default_value = "{}")]
        input: String,
    },
    /// 交互式通话模拟：每行一条转写片段，`me:` / `them:` 前缀选择声道
    Listen {
        #[arg(long, value_enum, default_value_t = Mode::Pattern)]
        mode: Mode,
        /// 覆盖配置中的模型名
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Pattern,
    Llm,
}

impl From<Mode> for DetectionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Pattern => DetectionMode::Pattern,
            Mode::Llm => DetectionMode::Llm,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "call_copilot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CopilotConfig::load_or_default(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let store = Arc::new(FileStore::new(config.store_path())?);
    let orchestrator = Arc::new(ConnectionOrchestrator::new(
        store,
        Arc::new(DefaultTransportFactory::new()),
        config.health,
    ));

    let result = run(cli.command, &config, &orchestrator).await;
    orchestrator.shutdown().await;
    result
}

async fn run(
    command: Command,
    config: &CopilotConfig,
    orchestrator: &Arc<ConnectionOrchestrator>,
) -> Result<()> {
    match command {
        Command::Servers => {
            for server in orchestrator.list_servers().await? {
                println!(
                    "{:<38} {:<20} {:<6} {:<12} {}",
                    server.id,
                    server.name,
                    server.transport.kind(),
                    server.status.as_str(),
                    if server.enabled { "" } else { "(disabled)" }
                );
            }
        }
        Command::AddStdio {
            name,
            env,
            auto_connect,
            command,
            args,
        } => {
            let env = parse_pairs(&env, '=')?;
            let created = orchestrator
                .create_server(NewServer {
                    name,
                    transport: TransportConfig::Stdio { command, args, env },
                    enabled: true,
                    auto_connect,
                })
                .await?;
            println!("✅ 已添加 {} ({})", created.name, created.id);
        }
        Command::AddHttp {
            name,
            headers,
            auto_connect,
            url,
        } => {
            let headers = parse_pairs(&headers, ':')?;
            let created = orchestrator
                .create_server(NewServer {
                    name,
                    transport: TransportConfig::Http { url, headers },
                    enabled: true,
                    auto_connect,
                })
                .await?;
            println!("✅ 已添加 {} ({})", created.name, created.id);
        }
        Command::Remove { id } => {
            orchestrator.delete_server(&id).await?;
            println!("🗑️ 已删除 {}", id);
        }
        Command::Import { file } => {
            let json = tokio::fs::read_to_string(&file).await?;
            for server in orchestrator.import_servers(&json).await? {
                println!("✅ 已导入 {} ({})", server.name, server.id);
            }
        }
        Command::Test { id } => {
            let result = orchestrator.test_connection(&id).await?;
            match result.error {
                None => {
                    println!("✅ 连接成功，耗时 {} ms", result.latency_ms);
                    for tool in result.tools {
                        println!("  - {}", tool.name);
                    }
                }
                Some(error) => println!("❌ 连接失败（{} ms）: {}", result.latency_ms, error),
            }
        }
        Command::Connect { id } => {
            for tool in orchestrator.connect(&id).await? {
                println!("  - {}", tool.namespaced_name());
            }
        }
        Command::Tools { query } => {
            connect_all(orchestrator).await?;
            let aggregator = ToolAggregator::new(orchestrator.registry().clone());
            let tools = match query {
                Some(q) => aggregator.search_tools(&q),
                None => aggregator.get_all_tools(),
            };
            for tool in tools {
                println!("{:<40} {}", tool.namespaced_name, tool.description());
            }
        }
        Command::Call { tool, input } => {
            let input: Value = serde_json::from_str(&input)
                .map_err(|e| ConfigError::ParseFailed(format!("工具输入不是合法 JSON: {}", e)))?;
            let (server_id, _) = call_copilot::mcp::parse_namespaced(&tool)?;
            orchestrator.connect(server_id).await?;
            let result = orchestrator.execute_namespaced(&tool, input).await?;
            println!("{}", result.to_content_string());
        }
        Command::Listen { mode, model } => {
            connect_all(orchestrator).await?;
            listen(config, orchestrator, mode.into(), model).await?;
        }
    }
    Ok(())
}

/// 初始化并连接所有启用的服务端；单个失败只记录
async fn connect_all(orchestrator: &ConnectionOrchestrator) -> Result<()> {
    orchestrator.initialize().await?;
    for server in orchestrator.list_servers().await? {
        if server.enabled
            && !server.status.is_live()
            && let Err(e) = orchestrator.connect(&server.id).await
        {
            tracing::warn!(server_id = %server.id, "连接失败: {}", e);
        }
    }
    Ok(())
}

fn build_llm(config: &CopilotConfig, model: Option<String>) -> Result<Option<Arc<dyn LlmClient>>> {
    let registry = ModelRegistry::from_env()?;
    let model_config = match model.or_else(|| config.model.clone()) {
        Some(name) => registry.get(&name)?,
        None => match registry.single() {
            Some(only) => only.clone(),
            None => return Ok(None),
        },
    };
    let mut client = DefaultLlmClient::new(reqwest::Client::new(), model_config);
    if let Some(temperature) = config.agent.temperature {
        client = client.with_temperature(temperature);
    }
    Ok(Some(Arc::new(client)))
}

async fn listen(
    config: &CopilotConfig,
    orchestrator: &Arc<ConnectionOrchestrator>,
    mode: DetectionMode,
    model: Option<String>,
) -> Result<()> {
    let aggregator = Arc::new(ToolAggregator::new(orchestrator.registry().clone()));
    let llm = build_llm(config, model)?;
    let mut detector = IntentDetector::new(aggregator.clone(), config.intent.clone())?;
    let agent = match &llm {
        Some(llm) => {
            detector = detector.with_llm(llm.clone());
            let executor: Arc<dyn ToolExecutor> = orchestrator.clone();
            Some(CallAgent::new(
                llm.clone(),
                aggregator.clone(),
                executor,
                config.agent.clone(),
            ))
        }
        None => {
            tracing::warn!("未配置 LLM 模型，仅运行规则意图检测");
            None
        }
    };

    println!(
        "🎧 {} 个工具可用。输入 `me: ...` / `them: ...`，`:reset` 开始新通话，`:quit` 退出",
        aggregator.len()
    );
    let mut editor = DefaultEditor::new().map_err(|e| CopilotError::Other(e.to_string()))?;
    let mut segments: Vec<TranscriptSegment> = Vec::new();
    let started = std::time::Instant::now();

    loop {
        let line = match tokio::task::block_in_place(|| editor.readline("> ")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(CopilotError::Other(e.to_string())),
        };
        let _ = editor.add_history_entry(line.as_str());

        match line.trim() {
            ":quit" => break,
            ":reset" => {
                segments.clear();
                detector.reset_cooldowns();
                if let Some(agent) = &agent {
                    agent.reset_conversation().await;
                }
                println!("🔄 新通话");
                continue;
            }
            _ => {}
        }
        let Some((channel, text)) = parse_line(&line) else {
            continue;
        };
        let start = segments.last().map_or(0.0, |s| s.end_time);
        let end = started.elapsed().as_secs_f64().max(start);
        segments.push(TranscriptSegment::new(channel, text, start, end));

        let detection = detector.detect(&segments, mode).await;
        if detection.detected {
            println!(
                "💡 {} ({:.2}) {}",
                detection.tool_name.as_deref().unwrap_or("-"),
                detection.confidence,
                Value::Object(detection.suggested_input)
            );
        }

        let Some(agent) = &agent else {
            continue;
        };
        if let Some(result) = agent.handle_utterance(&segments).await {
            for call in &result.tools_called {
                println!(
                    "  🔧 {}:{} {}",
                    call.server_id,
                    call.tool_name,
                    if call.success { "✓" } else { "✗" }
                );
            }
            match (&result.outcome, &result.response) {
                (_, Some(response)) => println!("🤖 {}", response),
                (AgentOutcome::Failed(error), None) => println!("❌ {}", error),
                (outcome, None) => println!("… {:?}", outcome),
            }
        }
    }
    Ok(())
}

fn parse_pairs(raw: &[String], separator: char) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|pair| {
            pair.split_once(separator)
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| {
                    ConfigError::InvalidValue {
                        field: pair.clone(),
                        message: format!("应为 KEY{}VALUE", separator),
                    }
                    .into()
                })
        })
        .collect()
}
