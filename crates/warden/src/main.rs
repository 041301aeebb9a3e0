mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = dispatch(cli).await;
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run(args) => {
            let (path, config) = commands::load_config(args.config.as_deref())?;
            setup_tracing(cli.verbose, config.debug);
            commands::run::run(args, path, config).await
        }
        Command::Check(args) => {
            setup_tracing(cli.verbose, false);
            commands::check::check(args).await
        }
        Command::Config(args) => {
            setup_tracing(cli.verbose, false);
            commands::config::config(args)
        }
        Command::GenerateSecret(args) => commands::generate_secret::generate_secret(args),
    }
}

fn setup_tracing(verbose: u8, debug: bool) {
    let verbose = if debug { verbose.max(2) } else { verbose };
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("WARDEN_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
