use std::path::Path;

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub fn config(args: ConfigArgs) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Show { config, format } => show(config.as_deref(), format),
    }
}

fn show(explicit: Option<&Path>, format: OutputFormat) -> Result<(), CliError> {
    let (_, config) = super::load_config(explicit)?;
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}
