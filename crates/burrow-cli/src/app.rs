//! # CLI Application
//!
//! CLI definition and command dispatch using clap.

use clap::{Parser, Subcommand};

use crate::commands::{cmd_genkey, cmd_pubkey, cmd_show, cmd_up, CliResult};

/// burrow - user-space layer-3 encrypted tunnel
#[derive(Parser)]
#[command(
    name = "burrow",
    version = env!("CARGO_PKG_VERSION"),
    about = "User-space layer-3 encrypted tunnel",
    after_help = "Examples:\n  \
        burrow genkey > private.key\n  \
        burrow pubkey < private.key\n  \
        sudo burrow up -c /etc/burrow/burrow.toml\n  \
        sudo burrow show -c /etc/burrow/burrow.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up and run until interrupted
    Up {
        /// Config file path
        #[arg(short, long, default_value = "/etc/burrow/burrow.toml")]
        config: String,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a private key and print it as hex
    Genkey,

    /// Read a hex private key on stdin and print its public key
    Pubkey,

    /// Query a running instance over its control socket
    Show {
        /// Config file path (locates the control socket)
        #[arg(short, long, default_value = "/etc/burrow/burrow.toml")]
        config: String,
    },
}

pub fn run() -> CliResult {
    let cli = Cli::parse();

    match cli.command {
        Commands::Up { config, verbose } => {
            init_logger(if verbose { "debug" } else { "info" });
            cmd_up(&config)
        }
        Commands::Genkey => cmd_genkey(),
        Commands::Pubkey => cmd_pubkey(),
        Commands::Show { config } => cmd_show(&config),
    }
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}
