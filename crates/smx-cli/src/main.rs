//! smx command-line tool
//!
//! Loads compiled plugin images and runs, inspects or disassembles them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "smx")]
#[command(about = "Run and inspect compiled smx plugins", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plugin's entry point or one of its public functions
    Run {
        /// Plugin image
        file: PathBuf,
        /// Public function to call instead of the entry point
        #[arg(short, long)]
        function: Option<String>,
        /// Argument for the function (repeatable); ints, floats or strings
        #[arg(short, long = "arg")]
        args: Vec<String>,
        /// Abort after this many instructions
        #[arg(long)]
        step_budget: Option<u64>,
    },

    /// Show plugin metadata, publics and natives
    Info {
        /// Plugin image
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Disassemble the code section
    Disasm {
        /// Plugin image
        file: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            file,
            function,
            args,
            step_budget,
        } => commands::run::execute(commands::run::RunArgs {
            file,
            function,
            args,
            step_budget,
        }),

        Commands::Info { file, json } => commands::info::execute(&file, json),

        Commands::Disasm { file } => commands::disasm::execute(&file),
    }
}
