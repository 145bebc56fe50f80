use std::fs;
use std::io;
use std::process::ExitCode;

use clap::Parser;
use clap_num::maybe_hex;
use ravelcore::config::{Config, InstructionWeights};

/// Assemble, link, and run one or more RV32IM assembly sources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Assembly source files to assemble and link into one image
    sources: Vec<String>,

    /// Disable the cycle-counting cache model
    #[arg(long)]
    no_cache: bool,

    /// Instruction budget before the run is aborted (use 0x prefix for
    /// hexadecimal)
    #[arg(long, value_parser=maybe_hex::<u64>)]
    timeout: Option<u64>,

    /// Arena size in bytes (use 0x prefix for hexadecimal)
    #[arg(long, value_parser=maybe_hex::<usize>)]
    max_storage: Option<usize>,

    /// Keep register/instruction-ring debug info for fault dumps
    #[arg(short, long)]
    keep_debug_info: bool,

    /// Trace every fetched instruction to stderr
    #[arg(short, long)]
    trace: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let sources: Result<Vec<String>, _> = args.sources.iter().map(fs::read_to_string).collect();
    let sources = match sources {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ravelsim: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut config = Config::new(sources, &mut stdin, &mut stdout);
    config.cache_enabled = !args.no_cache;
    config.keep_debug_info = args.keep_debug_info;
    config.print_insts = args.trace;
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(max_storage) = args.max_storage {
        config.max_storage = max_storage;
    }
    config.instruction_weights = InstructionWeights::default();

    match ravelcore::simulate(config) {
        Ok(cycles) => {
            println!("cycles: {cycles}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ravelsim: {e}");
            ExitCode::FAILURE
        }
    }
}
