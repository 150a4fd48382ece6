use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod sync;

use commands::{
    ConfigCommand, ExerciseCommand, FoodCommand, MealCommand, ProductCommand, RoutineCommand,
    SessionCommand, SetCommand, SyncCommand,
};
use config::Config;
use repfit_core::{LocalStore, OperationQueue};

#[derive(Parser)]
#[command(name = "repfit")]
#[command(version)]
#[command(about = "Offline-first workout and nutrition log", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workout routines
    Routine(RoutineCommand),

    /// Manage exercises within a routine
    Exercise(ExerciseCommand),

    /// Manage sets within an exercise
    Set(SetCommand),

    /// Track workout sessions
    Session(SessionCommand),

    /// Log food
    Food(FoodCommand),

    /// Manage custom products
    Product(ProductCommand),

    /// Manage custom meals
    Meal(MealCommand),

    /// Sync queued changes with the server
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repfit=info,repfit_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let store = LocalStore::open(&config.database_path.value).await?;
    let queue = OperationQueue::new(store.clone());
    let queued_before = queue.len().await?;

    match command {
        Commands::Routine(cmd) => cmd.run(&queue).await?,
        Commands::Exercise(cmd) => cmd.run(&queue).await?,
        Commands::Set(cmd) => cmd.run(&queue).await?,
        Commands::Session(cmd) => cmd.run(&queue).await?,
        Commands::Food(cmd) => cmd.run(&queue).await?,
        Commands::Product(cmd) => cmd.run(&queue).await?,
        Commands::Meal(cmd) => cmd.run(&queue).await?,
        Commands::Sync(cmd) => return Ok(cmd.run(&config, &store).await?),
        Commands::Config(cmd) => return cmd.run(&config),
    }

    if queue.len().await? > queued_before {
        sync::try_auto_sync(&config, &store).await;
    }

    Ok(())
}
