//! VPN connection control (vpnctl)
//!
//! Minimal host for the VPN plugin: lists VPN connections, follows their
//! state and triggers connect/disconnect actions.
//!
//! # Usage
//!
//! ```bash
//! vpnctl list
//! vpnctl list --json
//! vpnctl watch
//! vpnctl connect "Office VPN"
//! vpnctl disconnect "Office VPN"
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use libvpnctl::{HostHandles, ItemObserver, Notifier, State, Untranslated, VpnConfig, VpnItem, VpnPlugin};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

/// How long connect/disconnect wait for the platform to react
const REQUEST_GRACE: Duration = Duration::from_secs(3);

/// VPN connection control
#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(author = "vpnctl contributors")]
#[command(version)]
#[command(about = "List, watch, connect and disconnect VPN connections", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List VPN connections
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print state changes until interrupted
    Watch,
    /// Start a VPN connection
    Connect {
        /// Connection name or id
        connection: String,
    },
    /// Stop a VPN connection
    Disconnect {
        /// Connection name or id
        connection: String,
    },
}

#[derive(Serialize)]
struct ItemView {
    id: String,
    name: String,
    state: State,
    active: Option<String>,
}

impl From<&VpnItem> for ItemView {
    fn from(item: &VpnItem) -> Self {
        Self {
            id: item.id().to_string(),
            name: item.text().to_string(),
            state: item.state(),
            active: item.active_instance(),
        }
    }
}

/// Prints warnings and remembers that one was shown
#[derive(Default)]
struct CliNotifier {
    warned: AtomicBool,
}

impl Notifier for CliNotifier {
    fn warning(&self, message: &str) {
        eprintln!("Warning: {}", message);
        self.warned.store(true, Ordering::SeqCst);
    }
}

/// Prints every state change
struct Printer;

impl ItemObserver for Printer {
    fn notify(&self, item: &VpnItem) {
        println!("{}: {}", item.text(), item.state());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = VpnConfig::load_or_default(args.config.as_ref())
        .context("Failed to load configuration")?;

    let notifier = Arc::new(CliNotifier::default());
    let host = HostHandles {
        translator: Arc::new(Untranslated),
        notifier: notifier.clone(),
    };

    let plugin = VpnPlugin::start_default(&config, host)
        .await
        .context("Failed to start VPN plugin")?;
    debug!("Plugin ready with {} item(s)", plugin.items().len());

    match args.command {
        Command::List { json } => list(&plugin, json),
        Command::Watch => watch(&plugin).await,
        Command::Connect { connection } => {
            request(&plugin, &notifier, &connection, "connect").await
        }
        Command::Disconnect { connection } => {
            request(&plugin, &notifier, &connection, "disconnect").await
        }
    }
}

fn list(plugin: &VpnPlugin, json: bool) -> Result<()> {
    let views: Vec<ItemView> = plugin.items().iter().map(|i| ItemView::from(&**i)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("No VPN connections configured");
        return Ok(());
    }

    let width = views.iter().map(|v| v.name.len()).max().unwrap_or(0).max(4);
    println!("{:<width$}  {:<15}  {}", "NAME", "STATE", "ID", width = width);
    for view in &views {
        println!(
            "{:<width$}  {:<15}  {}",
            view.name,
            view.state.as_str(),
            view.id,
            width = width
        );
    }
    Ok(())
}

async fn watch(plugin: &VpnPlugin) -> Result<()> {
    let printer: Arc<dyn ItemObserver> = Arc::new(Printer);
    let items = plugin.items();
    for item in &items {
        println!("{}: {}", item.text(), item.state());
        item.add_observer(&printer);
    }

    info!("Watching {} VPN connection(s), press Ctrl+C to stop", items.len());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    for item in &items {
        item.remove_observer(&printer);
    }
    Ok(())
}

async fn request(
    plugin: &VpnPlugin,
    notifier: &CliNotifier,
    key: &str,
    action_id: &str,
) -> Result<()> {
    let item = plugin
        .find(key)
        .ok_or_else(|| anyhow!("No VPN connection named '{}'", key))?;

    let initial = item.state();
    let action = item
        .actions()
        .into_iter()
        .find(|a| a.id == action_id)
        .ok_or_else(|| anyhow!("Cannot {} '{}' while it is {}", action_id, item.text(), initial))?;

    info!("{} '{}'", action.label, item.text());
    action.activate();

    let deadline = tokio::time::Instant::now() + REQUEST_GRACE;
    while tokio::time::Instant::now() < deadline {
        if notifier.warned.load(Ordering::SeqCst) {
            bail!("Request for '{}' was rejected", item.text());
        }
        if item.state() != initial {
            println!("{}: {}", item.text(), item.state());
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if notifier.warned.load(Ordering::SeqCst) {
        bail!("Request for '{}' was rejected", item.text());
    }
    println!("{}: {}", item.text(), item.state());
    Ok(())
}

/// Initialize logging
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vpnctl={},libvpnctl={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}
