mod backend;
mod cli;
mod engine;
mod error;
mod logging;
mod model;
mod orchestrator;
mod steps;
#[cfg(test)]
mod testing;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_non_tui = !args.is_interactive();

    // The TUI owns the terminal, so its log goes to a file.
    let _log_guard = if is_non_tui {
        logging::init_stderr();
        None
    } else {
        let path = args
            .log_file
            .clone()
            .unwrap_or_else(logging::default_log_file);
        Some(logging::init_file(&path)?)
    };

    cli::run(args).await?;
    // Explicitly exit with code 0 on success, especially for non-TUI modes
    if is_non_tui {
        std::process::exit(0);
    }
    Ok(())
}
