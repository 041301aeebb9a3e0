use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Forward proxy for authenticated tunnel clients"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy until interrupted
    Run(RunArgs),
    /// Validate configuration and test list sources
    Check(CheckArgs),
    /// Inspect configuration
    Config(ConfigArgs),
    /// Print a new random hex secret
    GenerateSecret(SecretArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Config file (default: ./warden.toml, then the user config dir)
    #[arg(value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Override `bind-to` from the config file
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Config file (default: ./warden.toml, then the user config dir)
    #[arg(value_name = "CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration with defaults filled in
    Show {
        /// Config file (default: ./warden.toml, then the user config dir)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
}

#[derive(Args)]
pub struct SecretArgs {
    /// Secret length in bytes (at least 16)
    #[arg(long, default_value_t = 16)]
    pub bytes: usize,
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
