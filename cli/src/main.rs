use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_core::{ChatCallbacks, ChatClient, ChatConfig, InMemoryChatState, RequestOptions};
use parley_observability::{
    default_logs_dir, emit_event, init_logging, redact_text, LoggingConfig, ObservabilityEvent,
    ProcessKind,
};
use parley_transport::{ScriptedResponse, ScriptedTransport};
use parley_types::{ChatStatus, Message, MessageInput, ToolOutcome, UiStreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

const REPLAY_CHAT_ID: &str = "replay";

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Replay scripted chat responses through the Parley orchestrator")]
struct Cli {
    /// Directory for JSONL logs. Defaults to `.parley/logs`.
    #[arg(long, global = true, env = "PARLEY_LOGS_DIR")]
    logs_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a prompt against scripted responses and print the transcript.
    Replay {
        /// JSON array of responses: `-` for stdin, a file path, `@path`, or inline JSON.
        #[arg(long)]
        script: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        max_steps: Option<usize>,
        /// `<toolCallId>=<json>` applied after the first response settles.
        #[arg(long = "tool-result", value_name = "ID=JSON")]
        tool_results: Vec<String>,
        /// `<toolCallId>=<text>` reported as a failed tool call.
        #[arg(long = "tool-error", value_name = "ID=TEXT")]
        tool_errors: Vec<String>,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<String>,
    },
}

/// One scripted response: a list of events, or a rejection before any event.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptEntry {
    Events(Vec<UiStreamEvent>),
    Reject { reject: String },
}

impl From<ScriptEntry> for ScriptedResponse {
    fn from(entry: ScriptEntry) -> Self {
        match entry {
            ScriptEntry::Events(events) => ScriptedResponse::from(events),
            ScriptEntry::Reject { reject } => ScriptedResponse::reject(reject),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Transcript {
    chat_id: String,
    status: ChatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    messages: Vec<Message>,
    requests: usize,
    unused_responses: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            script,
            prompt,
            config,
            max_steps,
            tool_results,
            tool_errors,
        } => {
            let config_path = config.map(PathBuf::from);
            let config = ChatConfig::load(config_path.as_deref(), build_cli_overrides(max_steps))
                .await?;
            let logs_dir = resolve_logs_dir(cli.logs_dir);
            let logging = init_logging(
                &LoggingConfig::new(ProcessKind::Cli, logs_dir)
                    .with_retention_days(config.log_retention_days),
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "cli.main",
                    status: Some("ok"),
                    detail: Some("cli jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!(
                pruned = logging.info.pruned_files,
                "cli logging initialized: {:?}", logging.info
            );

            let responses = read_script(&script)?;
            let mut outcomes = tool_results
                .iter()
                .map(|raw| parse_tool_result(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            for raw in &tool_errors {
                outcomes.push(parse_tool_error(raw)?);
            }

            let transcript = replay(config, responses, &prompt, outcomes).await?;
            println!("{}", serde_json::to_string_pretty(&transcript)?);
        }
        Command::Config { config } => {
            let config_path = config.map(PathBuf::from);
            let config = ChatConfig::load(config_path.as_deref(), None).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn replay(
    config: ChatConfig,
    responses: Vec<ScriptedResponse>,
    prompt: &str,
    tool_outcomes: Vec<(String, ToolOutcome)>,
) -> anyhow::Result<Transcript> {
    let state = Arc::new(InMemoryChatState::new(REPLAY_CHAT_ID));
    let transport = Arc::new(ScriptedTransport::new(responses));
    let callbacks = ChatCallbacks::new()
        .on_finish(|message| {
            info!(message_id = %message.id, parts = message.parts.len(), "response finished");
        })
        .on_error(|err| {
            tracing::warn!(code = err.code(), "chat request failed: {err}");
        });
    let client = ChatClient::new(state, transport.clone())
        .with_config(config)
        .with_callbacks(callbacks)
        .with_process_kind(ProcessKind::Cli);

    info!(prompt = %redact_text(prompt), "replaying scripted chat");
    client
        .submit_message(MessageInput::user_text(prompt), RequestOptions::default())
        .await
        .context("submit prompt")?;
    for (tool_call_id, outcome) in tool_outcomes {
        client
            .add_tool_result(tool_call_id.clone(), outcome)
            .await
            .with_context(|| format!("apply tool result for `{tool_call_id}`"))?;
    }

    Ok(Transcript {
        chat_id: client.id().to_string(),
        status: client.status(),
        error: client.error().map(|err| err.to_string()),
        messages: client.messages(),
        requests: transport.request_count(),
        unused_responses: transport.remaining(),
    })
}

fn build_cli_overrides(max_steps: Option<usize>) -> Option<Value> {
    max_steps.map(|max_steps| serde_json::json!({ "maxSteps": max_steps }))
}

fn resolve_logs_dir(flag: Option<String>) -> PathBuf {
    match flag {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default_logs_dir(Path::new(".parley")),
    }
}

fn read_script(input: &str) -> anyhow::Result<Vec<ScriptedResponse>> {
    let raw = read_json_input(input)?;
    let entries: Vec<ScriptEntry> =
        serde_json::from_value(raw).context("script must be a JSON array of responses")?;
    Ok(entries.into_iter().map(ScriptedResponse::from).collect())
}

fn read_json_input(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    let path = Path::new(input.strip_prefix('@').unwrap_or(input));
    if input.starts_with('@') || path.is_file() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse script {}", path.display()));
    }
    serde_json::from_str(input).context("script is neither a readable file nor inline JSON")
}

fn split_assignment(raw: &str) -> anyhow::Result<(String, &str)> {
    let Some((id, value)) = raw.split_once('=') else {
        anyhow::bail!("expected `<toolCallId>=<value>`, got `{raw}`");
    };
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("tool call id cannot be empty in `{raw}`");
    }
    Ok((id.to_string(), value))
}

fn parse_tool_result(raw: &str) -> anyhow::Result<(String, ToolOutcome)> {
    let (id, value) = split_assignment(raw)?;
    let output = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((id, ToolOutcome::Output(output)))
}

fn parse_tool_error(raw: &str) -> anyhow::Result<(String, ToolOutcome)> {
    let (id, text) = split_assignment(raw)?;
    Ok((id, ToolOutcome::Error(text.to_string())))
}
