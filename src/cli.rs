// Command-line interface
//
// `duckcoding serve` runs the supervisor until SIGINT/SIGTERM;
// `duckcoding status` probes configured ports; `duckcoding config`
// prints the resolved stores for debugging.

use clap::{Parser, Subcommand};

use crate::models::ProxyStore;
use crate::paths;
use crate::store::DataStore;
use crate::tools::ALL_TOOLS;

#[derive(Parser, Debug)]
#[command(name = "duckcoding", version, about = "Transparent proxy supervisor for AI CLIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy supervisor (default)
    Serve,
    /// Probe each configured proxy port and report what answers
    Status,
    /// Print the resolved on-disk configuration
    Config {
        /// Show the proxy store instead of the global config
        #[arg(long)]
        proxy: bool,
    },
}

/// Handle the non-serve commands. Returns true when the process should
/// exit without starting the supervisor.
pub async fn handle(cli: &Cli) -> anyhow::Result<bool> {
    match &cli.command {
        None | Some(Command::Serve) => Ok(false),
        Some(Command::Status) => {
            print_status().await?;
            Ok(true)
        }
        Some(Command::Config { proxy }) => {
            print_config(*proxy)?;
            Ok(true)
        }
    }
}

async fn print_status() -> anyhow::Result<()> {
    let store = DataStore::new();
    let proxy: ProxyStore = store.read_json(&paths::proxy_file())?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()?;

    for tool in ALL_TOOLS {
        let cfg = proxy.get(tool);
        let url = format!("http://127.0.0.1:{}/healthz", cfg.port);
        let alive = client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        let state = if alive { "running" } else { "stopped" };
        println!(
            "{:<12} port {:<6} enabled={:<5} {}",
            tool.as_str(),
            cfg.port,
            cfg.enabled,
            state
        );
    }
    Ok(())
}

fn print_config(proxy: bool) -> anyhow::Result<()> {
    let store = DataStore::new();
    let value = if proxy {
        store.read_cached(&paths::proxy_file())?
    } else {
        store.read_cached(&paths::global_file())?
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
