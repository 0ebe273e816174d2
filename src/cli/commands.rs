//! CLI command implementations
//!
//! `serve` runs a node until interrupted. The client commands open one
//! session over TCP, run a single operation, close the session and print
//! the result as one JSON line. `watch` streams state events instead.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::runtime::Runtime;

use crate::client::{ChannelWatcher, Client, ClientConfig, ClientResult, KeeperState, Watcher};
use crate::protocol::Stat;
use crate::roster::ServerRoster;
use crate::server::{NodeConfig, NodeServer, ServerNode};
use crate::transport::TcpConnector;

use super::args::{ClientArgs, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_line, write_response};

/// Capacity of the event channel used by `watch`.
const WATCH_QUEUE_CAPACITY: usize = 64;

/// Run a CLI command
pub fn run_command(cmd: Command) -> CliResult<()> {
    let rt = Runtime::new()
        .map_err(|e| CliError::io_error(format!("Failed to create tokio runtime: {}", e)))?;

    match cmd {
        Command::Serve { config } => rt.block_on(serve(&config)),
        Command::Get { client, path } => rt.block_on(get(&client, &path)),
        Command::Set {
            client,
            path,
            data,
            version,
        } => rt.block_on(set(&client, &path, data, version)),
        Command::Create { client, path, data } => rt.block_on(create(&client, &path, data)),
        Command::Watch { client } => rt.block_on(watch(&client)),
    }
}

/// Run a serving node until Ctrl-C.
pub async fn serve(config_path: &Path) -> CliResult<()> {
    let config = NodeConfig::load(config_path)?;
    let node = Arc::new(ServerNode::standalone(
        config.settings(),
        config.quorum_role()?,
    ));

    let server = NodeServer::bind(node, config.listen_addr()?).await?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}

pub async fn get(args: &ClientArgs, path: &str) -> CliResult<()> {
    let client = open_client(args, None)?;
    let result = client.get_data(path).await;
    let read_only = client.is_read_only();
    client.close().await;

    let (data, stat) = report(result)?;
    write_response(json!({
        "path": path,
        "data": String::from_utf8_lossy(&data),
        "stat": stat,
        "read_only": read_only,
    }))
}

pub async fn set(args: &ClientArgs, path: &str, data: String, version: i32) -> CliResult<()> {
    let client = open_client(args, None)?;
    let result = client.set_data(path, data, version).await;
    client.close().await;

    let stat: Stat = report(result)?;
    write_response(json!({ "path": path, "stat": stat }))
}

pub async fn create(args: &ClientArgs, path: &str, data: String) -> CliResult<()> {
    let client = open_client(args, None)?;
    let result = client.create(path, data).await;
    client.close().await;

    let created = report(result)?;
    write_response(json!({ "path": created }))
}

/// Print state events until Ctrl-C or a terminal event.
pub async fn watch(args: &ClientArgs) -> CliResult<()> {
    let (watcher, mut events) = ChannelWatcher::channel(WATCH_QUEUE_CAPACITY);
    let client = open_client(args, Some(Arc::new(watcher)))?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let status = client.status();
                write_line(&json!({
                    "state": event.state.as_str(),
                    "session_id": format!("{:#018x}", status.session_id),
                    "endpoint": status.endpoint,
                }))?;
                if matches!(event.state, KeeperState::Expired | KeeperState::AuthFailed) {
                    break;
                }
            }
        }
    }

    client.close().await;
    write_line(&client.metrics())?;
    Ok(())
}

fn client_config(args: &ClientArgs) -> CliResult<ClientConfig> {
    let config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    Ok(if args.allow_read_only {
        config.with_allow_read_only(true)
    } else {
        config
    })
}

fn open_client(args: &ClientArgs, watcher: Option<Arc<dyn Watcher>>) -> CliResult<Client> {
    let config = client_config(args)?;
    let roster = Arc::new(ServerRoster::parse(&args.roster)?);
    Ok(Client::connect(
        roster,
        config,
        Arc::new(TcpConnector::new()),
        watcher,
    )?)
}

/// Print an operation failure as a JSON error line and pass it on.
fn report<T>(result: ClientResult<T>) -> CliResult<T> {
    result.map_err(|e| {
        let _ = write_error(e.code(), &e.to_string());
        CliError::from(e)
    })
}
