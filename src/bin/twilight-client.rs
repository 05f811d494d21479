//! Thin CLI shell: parses flags, loads config, calls
//! [`twilight_stream::connect_to_host`] or manages the known-hosts store
//! (spec §6.3).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use twilight_stream::client::host_list::HostList;
use twilight_stream::config::ClientConfig;

#[derive(Parser)]
#[command(name = "twilight-client", about = "Low-latency remote desktop streamer, client side")]
struct Cli {
    /// Directory for the persisted identity, host list, and
    /// `twilight-client.toml` config (default: current directory).
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,
    /// Overrides `log_filter` from the config file.
    #[arg(long)]
    log_filter: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dial a known host by nickname, or a bare `host[:port]` address to
    /// pair for the first time (spec §4.4).
    Connect { target: String },
    /// List previously-paired hosts (spec §4.9).
    ListHosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ClientConfig::load(&cli.state_dir.join("twilight-client.toml"))?;
    config.state_dir = cli.state_dir;
    if let Some(filter) = cli.log_filter {
        config.log_filter = filter;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Command::Connect { target } => twilight_stream::connect_to_host(config, &target).await,
        Command::ListHosts => {
            let hosts = HostList::load(&config.hosts_path())?;
            for entry in hosts.list() {
                println!("{}\t{}", entry.nickname, entry.addresses.join(","));
            }
            Ok(())
        }
    }
}
