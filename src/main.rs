use clap::{CommandFactory, Parser};
use ghg_processor::cli::{self, Args};
use std::process;

fn main() {
    let args = Args::parse();

    let Some(command) = args.command else {
        // No subcommand: show usage and exit cleanly
        let _ = Args::command().print_help();
        println!();
        process::exit(0);
    };

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create async runtime: {}", e);
        process::exit(1);
    });

    match runtime.block_on(cli::run(command)) {
        Ok(_) => process::exit(0),
        Err(error) => {
            eprintln!("Error: {:#}", error);
            process::exit(1);
        }
    }
}
