// Signet - NIP-46 remote signing daemon (bunker)
//
// Keeps private keys off the machines that use them. Apps talk to Signet over
// Nostr relays; every request passes a per-app policy before a key is used.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr::prelude::*;

use signet::config::{expand_home, SignetConfig, DEFAULT_CONFIG_PATH};
use signet::nip46::probe::{probe, PROBE_TIMEOUT};
use signet::Daemon;

#[derive(Parser)]
#[command(name = "signet")]
#[command(about = "NIP-46 remote signing daemon with kill switch and dead man's switch")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SIGNET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Start {
        /// Only activate these keys; the rest stay locked until unlocked
        #[arg(long = "key")]
        keys: Vec<String>,
    },
    /// Store a key in the configuration
    Add {
        /// Label for the key
        #[arg(long)]
        name: String,
        /// Private key (nsec or hex)
        #[arg(long, env = "SIGNET_NSEC", hide_env_values = true)]
        nsec: Option<String>,
    },
    /// Check a running bunker from the client side
    Probe {
        /// bunker://<pubkey>?relay=wss://...&secret=TOKEN
        uri: String,
    },
}

fn init_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // A panicking task is logged; the runtime keeps serving the other keys
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(location = %location, "Panic: {}", info);
    }));
    Ok(())
}

async fn start(config_path: &std::path::Path, keys: Vec<String>) -> Result<()> {
    let config = SignetConfig::load_or_create(config_path)?;
    let mut daemon = Daemon::new(config, config_path)?;
    daemon.boot(&keys).await?;
    daemon.run().await;
    Ok(())
}

fn add(config_path: &std::path::Path, name: &str, nsec: Option<String>) -> Result<()> {
    let secret = match nsec {
        Some(secret) => secret,
        None => {
            let keys = Keys::generate();
            println!("🔑 No key given, generated a new one");
            keys.secret_key().to_bech32().context("Failed to encode key")?
        }
    };

    let mut config = SignetConfig::load_or_create(config_path)?;
    let replaced = config.keys.contains_key(name.trim());
    let pubkey = config.add_key(name, &secret)?;
    config.save(config_path)?;

    println!(
        "✅ {} key '{}'",
        if replaced { "Replaced" } else { "Added" },
        name.trim()
    );
    println!("   npub: {}", pubkey.to_bech32().context("Failed to encode npub")?);
    println!("   config: {}", config_path.display());
    Ok(())
}

async fn run_probe(uri: &str) -> Result<()> {
    println!("🔐 Probing bunker...");
    let report = probe(uri, PROBE_TIMEOUT).await?;
    println!("✅ Bunker answered in {:.1}s", report.elapsed.as_secs_f64());
    println!(
        "   user: {}",
        report.user_pubkey.to_bech32().context("Failed to encode npub")?
    );
    println!("   signed test event: {} (not published)", report.signed.id.to_hex());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_home(&cli.config);

    // `verbose` in the config file counts too, if it can be read this early
    let file_verbose = std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|c| serde_json::from_str::<SignetConfig>(&c).ok())
        .is_some_and(|c| c.verbose);
    init_logging(cli.verbose || file_verbose)?;

    // tokio-tungstenite needs a process-wide crypto provider for wss://
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Start { keys } => start(&config_path, keys).await,
        Commands::Add { name, nsec } => add(&config_path, &name, nsec),
        Commands::Probe { uri } => run_probe(&uri).await,
    }
}
