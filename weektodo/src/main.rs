//! `weektodo` — headless peer-to-peer weekly todo list.
//!
//! Reads line commands from stdin and keeps the week in sync with connected
//! peers. Configuration via CLI flags, environment variables, or config file
//! (`~/.config/weektodo/config.toml`).
//!
//! ```bash
//! # Offline, tasks only
//! cargo run --bin weektodo
//!
//! # Through a relay, dialing bob on start
//! cargo run --bin weektodo -- --relay-url ws://127.0.0.1:9000/ws \
//!     --rest-url http://127.0.0.1:9000 --peer-id alice --connect bob
//! ```

use std::io;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use weektodo::cli::{Command, HELP, ParseError};
use weektodo::config::{CliArgs, ClientConfig, StorageBackend};
use weektodo::engine::{SyncEngine, SyncError, SyncRoute};
use weektodo::peer::Identity;
use weektodo::rest::RestClient;
use weektodo::store::{FileStore, MemoryStore, TaskStore};
use weektodo::transport::loopback::LoopbackNetwork;
use weektodo::transport::relay::RelayTransport;
use weektodo::transport::{PeerId, Transport};
use weektodo_proto::task::{Day, Task};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // stdout belongs to the prompt; logs go to a file.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("weektodo starting");

    let result = match config.storage {
        StorageBackend::File => match FileStore::open(config.todos_path()).await {
            Ok(store) => with_store(store, &config).await,
            Err(e) => Err(SyncError::from(e)),
        },
        StorageBackend::Memory => with_store(MemoryStore::new(), &config).await,
    };

    match result {
        Ok(()) => {
            tracing::info!("weektodo exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(err = %e, "weektodo failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("weektodo.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn with_store<S: TaskStore + 'static>(store: S, config: &ClientConfig) -> Result<(), SyncError> {
    let identity = Identity::load_or_create(config.identity_path(), config.device_profile()).await?;
    let rest = config.rest_url.as_ref().map(RestClient::new);

    let Some(relay_url) = &config.relay_url else {
        println!("no relay configured, running offline");
        let network = LoopbackNetwork::new(config.channel_capacity);
        let transport = network.endpoint(identity.peer_id());
        return run(store, transport, identity, rest, config).await;
    };

    match RelayTransport::connect(relay_url.as_str(), identity.peer_id()).await {
        Ok(transport) => run(store, transport, identity, rest, config).await,
        Err(e) => {
            println!("relay unreachable ({e}), running offline");
            let network = LoopbackNetwork::new(config.channel_capacity);
            let transport = network.endpoint(identity.peer_id());
            run(store, transport, identity, rest, config).await
        }
    }
}

async fn run<S: TaskStore + 'static, T: Transport>(
    store: S,
    transport: T,
    identity: Identity,
    rest: Option<RestClient>,
    config: &ClientConfig,
) -> Result<(), SyncError> {
    let engine = SyncEngine::init(store, transport, identity, rest, config.manager_options()).await?;
    println!("peer id: {}", engine.peer_id());

    for peer in &config.peers {
        engine.identity().remember(&PeerId::new(peer.as_str()));
    }
    let up = engine.resume().await;
    if up > 0 {
        println!("connected to {up} peer(s)");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(err = %e, "stdin read failed");
                break;
            }
        };
        let command = match Command::parse(&line) {
            Ok(c) => c,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = execute(&engine, command).await {
            println!("error: {e}");
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn execute<S: TaskStore + 'static, T: Transport>(
    engine: &SyncEngine<S, T>,
    command: Command,
) -> Result<(), SyncError> {
    let book = engine.book();
    match command {
        Command::Add { day, content } => {
            let task = book.add_todo(day, content, true).await?;
            println!("added {}", describe(&task));
        }
        Command::List { day } => {
            let days: Vec<Day> = day.map_or_else(|| Day::ALL.to_vec(), |d| vec![d]);
            for day in days {
                let todos = book.todos(day).await?;
                println!("{day}:");
                for task in &todos {
                    println!("  {}", describe(task));
                }
            }
        }
        Command::Delete { id } => {
            if book.delete_todo(id, true).await? {
                println!("deleted {id}");
            } else {
                println!("no task {id}");
            }
        }
        Command::Move { id, day } => {
            let task = book.move_todo_to_day(id, day, true).await?;
            println!("moved {}", describe(&task));
        }
        Command::Order { day, ids } => {
            let all = book.all_todos().await?;
            let mut ordered = Vec::with_capacity(ids.len());
            for id in ids {
                match all.iter().find(|t| t.id == Some(id)) {
                    Some(task) => ordered.push(task.clone()),
                    None => {
                        println!("no task {id}");
                        return Ok(());
                    }
                }
            }
            let stored = book.update_todo_order(day, ordered, true).await?;
            println!("{day} now has {} task(s)", stored.len());
        }
        Command::Connect { peer } => {
            let id = engine.connect(peer.as_ref()).await?;
            if peer.is_some() {
                println!("connected to {id}");
            } else {
                println!("peer id: {id}");
            }
        }
        Command::Disconnect { peer } => {
            engine.disconnect(peer.as_ref()).await;
            println!("disconnected");
        }
        Command::Sync => match engine.sync().await? {
            SyncRoute::Peers(n) => println!("sync requested from {n} peer(s)"),
            SyncRoute::Mirror(outcome) => println!(
                "synced through mirror: {} replaced, {} new",
                outcome.replaced, outcome.inserted
            ),
        },
        Command::Status => {
            println!("peer id: {}", engine.peer_id());
            println!("status:  {}", engine.sync_status());
            for peer in engine.identity().connected_peers() {
                let state = if engine.is_peer_connected(&peer) {
                    "open".to_string()
                } else {
                    engine
                        .manager()
                        .scheduler()
                        .attempts(&peer)
                        .map_or_else(|| "closed".to_string(), |n| format!("reconnecting, {n} attempt(s)"))
                };
                println!("  {peer}: {state}");
            }
            if let Some(at) = engine.identity().last_sync() {
                println!("last sync: {at}");
            }
        }
        Command::Export { path } => {
            let data = book.export_data().await?;
            match path {
                Some(path) => {
                    write_file(&path, &data).await?;
                    println!("exported to {}", path.display());
                }
                None => println!("{data}"),
            }
        }
        Command::Import { path } => {
            let data = tokio::fs::read_to_string(&path)
                .await
                .map_err(weektodo::store::StoreError::from)?;
            let count = book.import_data(&data).await?;
            println!("imported {count} task(s)");
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

async fn write_file(path: &Path, data: &str) -> Result<(), SyncError> {
    tokio::fs::write(path, data)
        .await
        .map_err(|e: io::Error| SyncError::from(weektodo::store::StoreError::from(e)))
}

fn describe(task: &Task) -> String {
    let id = task.id.map_or_else(|| "-".to_string(), |id| id.to_string());
    format!("[{id}] {} ({})", task.content, task.day)
}
