use abid_agent::config::DEFAULT_CONFIG_FILE;
use abid_agent::core::{Agent, AgentEvent, RunOptions};
use abid_agent::persistence::PersistenceManager;
use abid_agent::tools::{ConfirmationHandler, ConfirmationReason, ConfirmationRequest};
use abid_agent::{ApprovalPolicy, Config, Provider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "abid")]
#[command(version)]
#[command(about = "AI-powered coding assistant", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Config file (default: ./abid.json)")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    provider: Option<String>,

    #[arg(short, long, global = true)]
    model: Option<String>,

    #[arg(short, long, global = true)]
    workdir: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Approval policy")]
    approval: Option<String>,

    #[arg(long, global = true)]
    max_turns: Option<usize>,

    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a single prompt")]
    Run {
        prompt: String,

        #[arg(long, help = "Image to attach to the prompt")]
        image: Option<PathBuf>,

        #[arg(long, help = "No streaming output")]
        no_stream: bool,
    },

    #[command(about = "Interactive mode")]
    Interactive {
        #[arg(long, help = "No streaming output")]
        no_stream: bool,
    },
}

const HELP: &str = "\
/help                 show this help
/exit                 quit
/clear                clear the conversation
/tools                list tools
/mcp                  list MCP servers
/stats                session statistics
/save                 save the session
/sessions             list saved sessions and checkpoints
/resume <id>          resume a saved session
/checkpoint           save a checkpoint
/restore <id>         restore a checkpoint
/approval <policy>    change the approval policy
/model <name>         change the model";

/// Asks on the terminal. Reads happen on a blocking thread.
struct TerminalConfirmation;

#[async_trait]
impl ConfirmationHandler for TerminalConfirmation {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        let question = match request.reason {
            ConfirmationReason::BeforeExecution => format!(
                "Allow {} {}?",
                request.tool_name,
                serde_json::Value::Object(request.arguments.clone())
            ),
            ConfirmationReason::RetryAfterFailure => format!(
                "{} failed ({}). Retry?",
                request.tool_name,
                request.error.as_deref().unwrap_or("unknown error")
            ),
        };
        let prompt = format!("{} [y/N] ", question.yellow());
        matches!(
            read_line(prompt).await.as_deref().map(str::trim),
            Some("y") | Some("Y") | Some("yes")
        )
    }
}

async fn read_line(prompt: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .ok()
    .flatten()
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(args: &Args) -> Result<Config> {
    let workdir = args.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| workdir.join(DEFAULT_CONFIG_FILE));
    let mut config = Config::load(&path).await?;

    if args.workdir.is_some() {
        config.cwd = workdir;
    }
    if let Some(provider) = &args.provider {
        config.model.provider = Provider::from_str(provider)?;
    }
    if let Some(model) = &args.model {
        config.model.name = Some(model.clone());
    }
    if let Some(approval) = &args.approval {
        config.approval = ApprovalPolicy::from_str(approval)?;
    }
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
    }
    config.debug |= args.debug;
    Ok(config)
}

/// Runs one message, printing events as they arrive. Ctrl-C cancels the turn.
async fn run_turn(agent: &mut Agent, message: String, image: Option<PathBuf>, streaming: bool) {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let options = RunOptions {
        image,
        streaming,
        cancel,
    };
    let events = agent.run(message, options);
    futures::pin_mut!(events);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            AgentEvent::TextDelta { text } => {
                print!("{text}");
                let _ = stdout.flush();
            }
            AgentEvent::ToolCallStart { name, .. } => {
                eprintln!("\n{} {}", "→".cyan(), name.cyan());
            }
            AgentEvent::ToolCallComplete { call, result } => {
                if result.success {
                    eprintln!("{} {}", "✓".green(), call.name);
                } else {
                    eprintln!(
                        "{} {}: {}",
                        "✗".red(),
                        call.name,
                        result.error.as_deref().unwrap_or_default()
                    );
                }
                if let Some(diff) = &result.diff {
                    eprintln!("{}", diff.dimmed());
                }
            }
            AgentEvent::LoopDetected { description } => {
                eprintln!("{} {description}", "loop detected:".yellow());
            }
            AgentEvent::ContextCompacted {
                before_tokens,
                after_tokens,
            } => {
                let line = format!("context compacted: ~{before_tokens} → ~{after_tokens} tokens");
                eprintln!("{}", line.dimmed());
            }
            AgentEvent::TextComplete { .. } => println!(),
            AgentEvent::AgentEnd { rounds, usage } => {
                eprintln!(
                    "{}",
                    format!("{rounds} rounds, {} tokens", usage.total_tokens).dimmed()
                );
            }
            AgentEvent::Error { error } => eprintln!("\n{} {error}", "error:".red().bold()),
            AgentEvent::AgentStart { .. } => {}
        }
    }
    watcher.abort();
}

/// Handles a slash command. Returns `false` when the session should end.
async fn handle_command(agent: &mut Agent, store: &PersistenceManager, line: &str) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    match command {
        "/exit" | "/quit" => return false,
        "/help" => println!("{HELP}"),
        "/clear" => {
            agent.clear_history();
            println!("Conversation cleared.");
        }
        "/tools" => {
            for tool in agent.tools().await {
                let marker = if tool.enabled { "" } else { " (disabled)" };
                println!("  {}{marker}: {}", tool.name.bold(), tool.description);
            }
        }
        "/mcp" => {
            let servers = agent.mcp_servers();
            if servers.is_empty() {
                println!("No MCP servers configured.");
            }
            for server in servers {
                println!(
                    "  {} [{}] {} tools",
                    server.name.bold(),
                    server.status,
                    server.tool_count
                );
            }
        }
        "/stats" => match serde_json::to_string_pretty(&agent.stats().await) {
            Ok(stats) => println!("{stats}"),
            Err(e) => eprintln!("{} {e}", "error:".red()),
        },
        "/save" => match store.save_session(&agent.snapshot()).await {
            Ok(path) => println!("Saved to {}", path.display()),
            Err(e) => eprintln!("{} {e}", "error:".red()),
        },
        "/checkpoint" => match store.save_checkpoint(&agent.snapshot()).await {
            Ok(id) => println!("Checkpoint {id}"),
            Err(e) => eprintln!("{} {e}", "error:".red()),
        },
        "/sessions" => {
            for (label, listing) in [
                ("Sessions", store.list_sessions().await),
                ("Checkpoints", store.list_checkpoints().await),
            ] {
                match listing {
                    Ok(summaries) => {
                        println!("{label}:");
                        for summary in summaries {
                            println!(
                                "  {}  {} turns  {}",
                                summary.id.bold(),
                                summary.turn_count,
                                summary.updated_at.format("%Y-%m-%d %H:%M")
                            );
                        }
                    }
                    Err(e) => eprintln!("{} {e}", "error:".red()),
                }
            }
        }
        "/resume" | "/restore" => {
            let loaded = if command == "/resume" {
                store.load_session(argument).await
            } else {
                store.load_checkpoint(argument).await
            };
            match loaded {
                Ok(Some(snapshot)) => {
                    agent.restore(snapshot);
                    println!(
                        "Restored {} ({} messages).",
                        agent.session().session_id(),
                        agent.session().context().len()
                    );
                }
                Ok(None) => println!("Nothing saved under {argument:?}."),
                Err(e) => eprintln!("{} {e}", "error:".red()),
            }
        }
        "/approval" => match ApprovalPolicy::from_str(argument) {
            Ok(policy) => {
                agent.set_approval_policy(policy);
                println!("Approval policy: {policy}");
            }
            Err(e) => eprintln!("{} {e}", "error:".red()),
        },
        "/model" if !argument.is_empty() => {
            agent.set_model(argument);
            println!("Model: {argument}");
        }
        _ => println!("Unknown command. Type /help."),
    }
    true
}

async fn interactive(agent: &mut Agent, store: &PersistenceManager, streaming: bool) {
    println!(
        "{} {} / {}. Type /help for commands.",
        "abid".bold(),
        agent.adapter().provider_name(),
        agent.adapter().model()
    );

    loop {
        let Some(line) = read_line(format!("{} ", ">".green().bold())).await else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.starts_with('/') {
            if !handle_command(agent, store, input).await {
                break;
            }
            continue;
        }
        run_turn(agent, input.to_string(), None, streaming).await;
        println!();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = load_config(&args).await.context("loading configuration")?;
    init_tracing(config.debug);

    let mut agent = Agent::from_config(&config, Arc::new(TerminalConfirmation)).await?;
    let store = PersistenceManager::new(config.data_dir());

    match args.command {
        Commands::Run {
            prompt,
            image,
            no_stream,
        } => run_turn(&mut agent, prompt, image, !no_stream).await,
        Commands::Interactive { no_stream } => interactive(&mut agent, &store, !no_stream).await,
    }

    agent.shutdown().await;
    Ok(())
}
