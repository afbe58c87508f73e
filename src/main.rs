//! Aragora command-line surface.
//!
//! A thin mirror of the HTTP API: serve the engine, run a debate from
//! the terminal, replay a stored debate's event log, export transcripts.
//!
//! Exit codes: 0 success, 2 bad input, 3 auth failure, 4 rate limited,
//! 1 anything else.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use aragora::cancel::CancellationToken;
use aragora::config::AragoraConfig;
use aragora::engine::{DebateRequest, Engine, EngineError};
use aragora::export::{export_transcript, ExportFormat};
use aragora::server;

const EXIT_BAD_INPUT: u8 = 2;
const EXIT_AUTH: u8 = 3;
/// Reserved for fronting a remote engine; part of the exit-code contract.
#[allow(dead_code)]
const EXIT_RATE_LIMITED: u8 = 4;
const EXIT_OTHER: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "aragora", version, about = "Multi-agent debate engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + WebSocket server.
    Serve {
        /// Override the configured HTTP port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one debate to completion and print the result.
    Run {
        /// The task to debate.
        #[arg(long)]
        task: String,
        /// Comma-separated agent specs (e.g. `anthropic-api,openai-api`
        /// or `critic=openai/gpt-4o-mini`).
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        #[arg(long)]
        rounds: Option<u32>,
        /// Consensus policy: majority, supermajority, unanimous, judge,
        /// weighted.
        #[arg(long)]
        policy: Option<String>,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Print the stored event log of a debate, in order.
    Replay {
        /// Debate slug or id.
        slug: String,
    },
    /// Export a debate transcript.
    Export {
        /// Debate slug or id.
        slug: String,
        /// Output format: json, csv, or html.
        #[arg(long, default_value = "json")]
        format: String,
        /// Output path; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Issue a bearer token for a subject (requires AUTH_TOKEN_HMAC_KEY).
    Token {
        subject: String,
    },
}

fn exit_code_for(err: &EngineError) -> u8 {
    match err {
        EngineError::InvalidInput(_) | EngineError::NoProvider(_) => EXIT_BAD_INPUT,
        _ => EXIT_OTHER,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            if let Some(engine_err) = err.downcast_ref::<EngineError>() {
                return ExitCode::from(exit_code_for(engine_err));
            }
            ExitCode::from(EXIT_OTHER)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = AragoraConfig::from_env();

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let engine = Engine::new(config)?;
            server::serve(engine).await.context("server failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            task,
            agents,
            rounds,
            policy,
            domain,
        } => {
            if agents.len() < 2 {
                eprintln!("need at least two agents");
                return Ok(ExitCode::from(EXIT_BAD_INPUT));
            }
            let engine = Engine::new(config)?;
            let request = DebateRequest {
                task: task.clone(),
                agents,
                rounds,
                policy,
                domain,
            };
            let debate_agents = engine.build_agents(&request.agents)?;
            let settings = engine.settings_for(&request)?;
            let debate_id = uuid::Uuid::new_v4().to_string();
            let record = engine
                .run_debate_with_agents(
                    &debate_id,
                    &task,
                    &debate_agents,
                    &settings,
                    &CancellationToken::new(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Replay { slug } => {
            let engine = Engine::new(config)?;
            let debate = engine
                .store
                .get_debate_by_slug(&slug)?
                .with_context(|| format!("no debate '{slug}'"))?;
            let mut cursor = 0;
            loop {
                let events = engine.store.events_after(&debate.debate_id, cursor, 500)?;
                if events.is_empty() {
                    break;
                }
                for event in events {
                    cursor = event.seq;
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Export { slug, format, out } => {
            let Some(format) = ExportFormat::parse(&format) else {
                eprintln!("unknown format '{format}' (expected json, csv, or html)");
                return Ok(ExitCode::from(EXIT_BAD_INPUT));
            };
            let engine = Engine::new(config)?;
            let debate = engine
                .store
                .get_debate_by_slug(&slug)?
                .with_context(|| format!("no debate '{slug}'"))?;
            let messages = engine.store.messages_for(&debate.debate_id)?;
            let rendered = export_transcript(&debate, &messages, format)?;
            match out {
                Some(path) => std::fs::write(&path, rendered)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{rendered}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Token { subject } => {
            let engine = Engine::new(config)?;
            match engine.auth.issue(&subject) {
                Some(token) => {
                    println!("{token}");
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("auth is disabled; set AUTH_TOKEN_HMAC_KEY");
                    Ok(ExitCode::from(EXIT_AUTH))
                }
            }
        }
    }
}
