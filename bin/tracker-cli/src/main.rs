//! Tracker CLI - Admin Command Line Interface
//!
//! Namespace and membership commands against a running tracker, plus a
//! `node` command that behaves like a storage node.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracker_client::{ClientInfo, ClientStatus, EntryInfo, EntryKind, TrackerClient};
use tracker_common::{Attributes, ClientId};

#[derive(Parser, Debug)]
#[command(name = "tracker-cli")]
#[command(about = "Tracker Admin CLI")]
#[command(version)]
struct Args {
    /// Tracker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:5671", env = "TRACKER_ADDR")]
    tracker: String,

    /// Print responses as JSON
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a storage node
    Register {
        hostname: String,
        port: u16,
    },
    /// Send one heartbeat for a registered node
    Heartbeat {
        client_id: u64,
    },
    /// Create a directory and any missing parents
    Mkdir {
        path: String,
        /// Attribute on the new directory, as key=value
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
    },
    /// Create a file
    Create {
        path: String,
        /// Attribute on the new file, as key=value
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
    },
    /// Delete a file
    Delete {
        path: String,
    },
    /// Show one entry
    Stat {
        path: String,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// List registered storage nodes
    Clients,
    /// Register, then heartbeat until interrupted
    Node {
        hostname: String,
        port: u16,
        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "3000")]
        interval_ms: u64,
    },
}

fn parse_attr(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn kind_name(kind: i32) -> &'static str {
    match EntryKind::try_from(kind) {
        Ok(EntryKind::Directory) => "directory",
        Ok(EntryKind::File) => "file",
        Err(_) => "unknown",
    }
}

fn status_name(status: i32) -> &'static str {
    match ClientStatus::try_from(status) {
        Ok(ClientStatus::Alive) => "ALIVE",
        Ok(ClientStatus::Dead) => "DEAD",
        Err(_) => "UNKNOWN",
    }
}

fn entry_json(entry: &EntryInfo) -> Value {
    json!({
        "path": entry.path,
        "kind": kind_name(entry.kind),
        "attrs": entry.attrs,
    })
}

fn client_json(client: &ClientInfo) -> Value {
    json!({
        "client_id": client.client_id,
        "hostname": client.hostname,
        "port": client.port,
        "status": status_name(client.status),
        "registered_at_ms": client.registered_at_ms,
        "last_heartbeat_ms": client.last_heartbeat_ms,
    })
}

fn print_entry(entry: &EntryInfo) {
    let mut attrs: Vec<_> = entry.attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    attrs.sort();
    println!("{:<10} {:<40} {}", kind_name(entry.kind), entry.path, attrs.join(","));
}

struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, value: &Value, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }

    fn mutation(&self, op: &str, path: &str, success: bool) -> Result<()> {
        self.emit(&json!({ "op": op, "path": path, "success": success }), || {
            if success {
                println!("{op} {path}: ok");
            } else {
                println!("{op} {path}: nothing changed");
            }
        })
    }
}

async fn run_node(client: &TrackerClient, hostname: &str, port: u16, interval: Duration) -> Result<()> {
    let id = client.register(hostname, port).await.context("registration failed")?;
    info!("Registered as client {}", id);
    println!("Registered {hostname}:{port} as client {id}");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                return Ok(());
            }
        }
        let beat = client.heartbeat(id).await.context("heartbeat failed")?;
        if !beat.success {
            anyhow::bail!("tracker no longer knows client {id}; register again");
        }
        for command in beat.commands {
            println!("remove {}", command.path);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let client = TrackerClient::connect(args.tracker.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.tracker))?;
    let out = Output { json: args.json };

    match args.command {
        Commands::Register { hostname, port } => {
            let id = client.register(&hostname, port).await?;
            out.emit(&json!({ "client_id": id.as_u64() }), || {
                println!("Registered {hostname}:{port} as client {id}");
            })?;
        }
        Commands::Heartbeat { client_id } => {
            let beat = client.heartbeat(ClientId(client_id)).await?;
            let paths: Vec<_> = beat.commands.iter().map(|c| c.path.clone()).collect();
            out.emit(&json!({ "success": beat.success, "remove": paths }), || {
                if beat.success {
                    println!("Heartbeat accepted");
                    for path in &paths {
                        println!("remove {path}");
                    }
                } else {
                    println!("Heartbeat rejected: client {client_id} is unknown or dead");
                }
            })?;
        }
        Commands::Mkdir { path, attrs } => {
            let attrs: Attributes = attrs.into_iter().collect();
            let success = client.mkdir(&path, &attrs).await?;
            out.mutation("mkdir", &path, success)?;
        }
        Commands::Create { path, attrs } => {
            let attrs: Attributes = attrs.into_iter().collect();
            let success = client.create_file(&path, &attrs).await?;
            out.mutation("create", &path, success)?;
        }
        Commands::Delete { path } => {
            let success = client.delete_file(&path).await?;
            out.mutation("delete", &path, success)?;
        }
        Commands::Stat { path } => match client.stat(&path).await? {
            Some(entry) => out.emit(&entry_json(&entry), || print_entry(&entry))?,
            None => out.emit(&Value::Null, || println!("{path}: not found"))?,
        },
        Commands::Ls { path } => {
            let entries = client.list(&path).await?;
            let value = Value::Array(entries.iter().map(entry_json).collect());
            out.emit(&value, || {
                if entries.is_empty() {
                    println!("(empty)");
                }
                for entry in &entries {
                    print_entry(entry);
                }
            })?;
        }
        Commands::Clients => {
            let clients = client.clients().await?;
            let value = Value::Array(clients.iter().map(client_json).collect());
            out.emit(&value, || {
                if clients.is_empty() {
                    println!("No storage nodes registered");
                    return;
                }
                println!(
                    "{:<24} {:<30} {:<8} {:<16}",
                    "CLIENT ID", "ADDRESS", "STATUS", "LAST HEARTBEAT"
                );
                println!("{}", "-".repeat(80));
                for c in &clients {
                    println!(
                        "{:<24} {:<30} {:<8} {:<16}",
                        c.client_id,
                        format!("{}:{}", c.hostname, c.port),
                        status_name(c.status),
                        c.last_heartbeat_ms
                    );
                }
            })?;
        }
        Commands::Node {
            hostname,
            port,
            interval_ms,
        } => {
            if interval_ms == 0 {
                warn!("Heartbeat interval of 0 ms raised to 1 ms");
            }
            run_node(&client, &hostname, port, Duration::from_millis(interval_ms.max(1))).await?;
        }
    }

    client.close().await;
    Ok(())
}
