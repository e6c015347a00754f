mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};
use tabletop_sync::SyncError;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run_command(&cli).await {
        if cli.json {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
        } else {
            eprintln!("error: {e}");
        }
        std::process::exit(1);
    }
}

async fn run_command(cli: &Cli) -> Result<(), SyncError> {
    match &cli.command {
        Command::Flatten { board, start_index } => {
            commands::flatten_board(cli, board, *start_index)
        }
        Command::Inspect { board } => commands::inspect(cli, board),
        Command::Simulate {
            board,
            clients,
            timeout,
        } => commands::simulate(cli, board, *clients, *timeout).await,
    }
}
