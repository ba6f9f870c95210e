mod app;
mod args;
mod logging;
mod prompt;
mod resources;
mod stream;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use crate::args::{Cli, Command};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.quiet);
    if let Err(err) = try_run(cli) {
        error!(error = %err, "CLI failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate(args) => app::run_generate(args, cli.quiet),
        Command::Inspect(args) => app::run_inspect(args),
    }
}
