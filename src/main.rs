use std::path::Path;

use clap::Parser;
use fire_bootstrap::api::{Cli, Command, run_http_server, simulate_command};
use fire_bootstrap::core::HistoricalReturns;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port, data } => {
            let history = load_history(&data);
            if let Err(e) = run_http_server(port, history).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate { data, args } => {
            let history = load_history(&data);
            match simulate_command(&history, args) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn load_history(path: &Path) -> HistoricalReturns {
    match HistoricalReturns::from_csv_path(path) {
        Ok(history) => history,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}
