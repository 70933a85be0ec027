//! # rewind
//!
//! Relay server plus two interactive peers: a counter app that mirrors its
//! state to an inspector, and a console inspector that can rewind it.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rewind_client::{ClientOptions, InspectorClient, InspectorEvent, Store, SyncMiddleware, TypedFeature, WsTransport};
use rewind_core::protocol::ActionInfo;
use rewind_core::SessionId;
use rewind_relay::ServerConfig;
use rewind_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "rewind", about = "Remote time-travel debugging relay")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Default log level (RUST_LOG overrides).
    #[arg(long, global = true)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "9092")]
        port: u16,
        /// Per-connection outbound queue length.
        #[arg(long)]
        max_send_queue: Option<usize>,
    },
    /// Counter app: `1` increments, `x` exits.
    Counter {
        /// Relay application endpoint. Falls back to REWIND_ENDPOINT.
        #[arg(long)]
        endpoint: Option<String>,
        /// Falls back to REWIND_SESSION_ID.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Capture call stacks, keeping this many frames (0 keeps all).
        #[arg(long)]
        stack_trace: Option<usize>,
    },
    /// Console inspector: `jump <n> <stateJson>`, `commit`, `x` exits.
    Inspect {
        /// Relay inspector endpoint.
        #[arg(long, default_value = "ws://127.0.0.1:9092/inspector")]
        endpoint: String,
        #[arg(long)]
        session: String,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CounterState {
    count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Increment;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let interactive = !matches!(cli.command, Command::Serve { .. });
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli
            .log_level
            .unwrap_or(if interactive { Level::WARN } else { Level::INFO }),
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Compact },
        ..Default::default()
    });

    match cli.command {
        Command::Serve {
            host,
            port,
            max_send_queue,
        } => serve(host, port, max_send_queue).await,
        Command::Counter {
            endpoint,
            session,
            name,
            stack_trace,
        } => counter(endpoint, session, name, stack_trace).await,
        Command::Inspect { endpoint, session } => inspect(endpoint, session).await,
    }
}

async fn serve(host: String, port: u16, max_send_queue: Option<usize>) -> Result<()> {
    let mut config = ServerConfig {
        host,
        port,
        ..Default::default()
    };
    if let Some(n) = max_send_queue {
        config.max_send_queue = n;
    }

    let handle = rewind_relay::start(config)
        .await
        .context("failed to start relay")?;
    tracing::info!(app = %handle.app_url(), inspector = %handle.inspector_url(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn counter(
    endpoint: Option<String>,
    session: Option<String>,
    name: Option<String>,
    stack_trace: Option<usize>,
) -> Result<()> {
    let mut options = ClientOptions::from_env();
    if let Some(endpoint) = endpoint {
        options.endpoint = Some(endpoint);
    }
    if let Some(session) = session {
        options.session_id = Some(SessionId::from_raw(session));
    }
    if let Some(name) = name {
        options = options.with_name(name);
    }
    if let Some(limit) = stack_trace {
        options = options.enable_stack_trace(limit);
    }

    let middleware = SyncMiddleware::websocket(options)?;
    let counter = Arc::new(
        TypedFeature::new("counter", CounterState::default())
            .on(|s: &CounterState, _: Increment| CounterState { count: s.count + 1 }),
    );
    let store = Arc::new(
        Store::new()
            .with_feature(counter.clone())
            .with_middleware(middleware.clone()),
    );
    store.initialize().await.context("failed to join session")?;

    println!("session {}: press 1 then enter to increment, x to exit", middleware.session_id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "1" => {
                if store.dispatch(&Increment)? {
                    println!("count = {}", counter.get().count);
                } else {
                    println!("viewing history (count = {}), commit in the inspector first", counter.get().count);
                }
            }
            "x" => break,
            "" => println!("count = {}", counter.get().count),
            other => println!("unknown input {other:?}"),
        }
    }

    middleware.close().await;
    Ok(())
}

async fn inspect(endpoint: String, session: String) -> Result<()> {
    let transport = Arc::new(WsTransport::new(endpoint, Duration::from_secs(30)));
    let (client, mut events) = InspectorClient::new(transport);
    client.connect().await?;
    client.join_session(&session).await?;
    println!("watching session {session}");

    let printer = tokio::spawn(async move {
        let mut seen = 0u64;
        while let Some(event) = events.recv().await {
            match event {
                InspectorEvent::Configure(options) => {
                    println!("app {:?} connected (max history {})", options.name, options.max_history);
                }
                InspectorEvent::Initialize { state_json } => {
                    seen = 0;
                    println!("[init] {state_json}");
                }
                InspectorEvent::Dispatch {
                    action_json,
                    state_json,
                    stack_trace,
                } => {
                    seen += 1;
                    let action = serde_json::from_str::<ActionInfo>(&action_json)
                        .map(|a| a.action_type)
                        .unwrap_or(action_json);
                    println!("[{seen}] {action} -> {state_json}");
                    if let Some(stack) = stack_trace.and_then(|s| serde_json::from_str::<String>(&s).ok()) {
                        for frame in stack.split("\r\n") {
                            println!("      {frame}");
                        }
                    }
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "x" {
            break;
        }
        if let Err(e) = run_command(&client, line).await {
            println!("error: {e:#}");
        }
    }

    client.close().await;
    printer.abort();
    Ok(())
}

async fn run_command(client: &InspectorClient, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("jump") => {
            let action_id: u64 = parts
                .next()
                .context("usage: jump <n> <stateJson>")?
                .parse()
                .context("action id must be a number")?;
            let state = parts.next().context("usage: jump <n> <stateJson>")?;
            serde_json::from_str::<serde_json::Value>(state).context("state is not valid JSON")?;
            client.jump_to_state(action_id, state).await?;
        }
        Some("commit") => client.commit().await?,
        Some("") | None => {}
        Some(other) => bail!("unknown command {other:?}"),
    }
    Ok(())
}
