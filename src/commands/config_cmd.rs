use clap::{Args, Subcommand};
use std::fs;
use std::io::Write;
use std::path::Path;

use super::OutputFormat;
use crate::config::Config;

const DEFAULT_CONFIG: &str = r#"# repfit configuration

# Path to SQLite database (default: platform data dir, e.g. ~/.local/share/repfit/repfit.db)
# database_path: ~/.local/share/repfit/repfit.db

sync:
  # server_url: "http://localhost:8080"
  # api_key: "your-api-key"

  # Drain the queue after every change
  auto_sync: false

  # Seconds between drains in `repfit sync watch`
  period_secs: 30

  # Attempts before a change is given up on
  max_retries: 5

  # Changes sent per drain
  batch_size: 50
"#;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => print_config(config),
                }
                Ok(())
            }
            ConfigSubcommand::Init => {
                let config_path = Config::default_config_path();
                if write_default_config(&config_path)? {
                    println!("Created config file: {}", config_path.display());
                    println!("\nEdit this file to customize your settings.");
                } else {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'repfit config show' to view current configuration.");
                }
                Ok(())
            }
        }
    }
}

fn print_config(config: &Config) {
    println!("Configuration");
    println!("=============\n");

    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!(
            "Config file: {} (not found)",
            Config::default_config_path().display()
        ),
    }
    println!();

    println!("database_path: {}", config.database_path.value.display());
    println!("  source: {}", config.database_path.source);
    println!();

    let sync = &config.sync;
    println!(
        "sync.server_url:   {}",
        sync.server_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "sync.api_key:      {}",
        if sync.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!("sync.auto_sync:    {}", sync.auto_sync);
    println!("sync.period_secs:  {}", sync.period_secs);
    println!("sync.max_retries:  {}", sync.max_retries);
    println!("sync.batch_size:   {}", sync.batch_size);
}

/// Returns false without touching anything if the file already exists.
fn write_default_config(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    file.write_all(DEFAULT_CONFIG.as_bytes())?;
    Ok(true)
}
