use crate::report::Reporter;
use crate::stores::Registry;
use crate::*;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, error};
use std::fs::read_to_string;
use std::path::Path;

/// The built-in phases: find, insert, update and delete under a thread sweep.
const DEFAULT_BENCH: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/presets/benchmarks/all_ops.toml"
));

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 's')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the key-value store's TOML config file")]
    store_config: String,

    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the benchmark's TOML config file (default: all operations preset)")]
    benchmark_config: Option<String>,

    #[arg(short = 'o')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to a file that results are appended to")]
    output: Option<String>,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a benchmark")]
    Bench(BenchArgs),
    #[command(about = "List all registered key-value stores")]
    List,
}

fn read_config(path: &str) -> Result<String> {
    read_to_string(path).map_err(|e| Error::Config(format!("cannot read {}: {}", path, e)))
}

fn bench_cli(args: &BenchArgs) -> Result<()> {
    let opt: String = {
        let s = read_config(&args.store_config)?;
        let b = match args.benchmark_config.as_deref() {
            Some(b) => read_config(b)?,
            None => DEFAULT_BENCH.to_string(),
        };
        s + "\n" + &b
    };

    let (map, phases) = crate::bench::init(&opt)?;
    let mut reporter = match args.output.as_deref() {
        Some(o) => Reporter::with_file(Path::new(o))?,
        None => Reporter::stdout(),
    };
    map.bench(&phases, &mut reporter)
}

fn list_cli() {
    for r in inventory::iter::<Registry> {
        println!("Registered map: {}", r.name);
    }
}

/// The default command line interface.
///
/// This function is public and can be called in a different crate. For example, one can integrate
/// their own key-value stores by registering the constructor function. Then, adding this function
/// will produce a benchmark binary that has the same usage as the one in this crate.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// kvopbench -h
/// ```
///
/// The interface supports two modes, `bench` and `list`.
///
/// ### Benchmark Mode
///
/// Usage:
///
/// ```bash
/// kvopbench bench -s <STORE_CONFIG> [-b <BENCH_CONFIG>] [-o <OUTPUT>]
/// ```
///
/// Where `STORE_CONFIG` and `BENCH_CONFIG` are the paths to the key-value store and benchmark
/// configuration files, respectively. For their format, you can refer to the documentations of
/// [`crate::stores`] and [`crate::bench`]. Without `-b`, the built-in preset runs find, insert,
/// update and delete phases over 100M prefilled keys with 1, 2, 4, ... 36 threads and then 9, 18
/// and 24 threads.
///
/// Results are printed to stdout, and also appended to `OUTPUT` if given. The process exits with
/// status 1 as soon as a run fails.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// kvopbench list
/// ```
///
/// This command lists all registered key-value stores' names.
pub fn cmdline() {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting kvopbench with args: {:?}", cli);
    let result = match cli.command {
        Commands::Bench(args) => bench_cli(&args),
        Commands::List => {
            list_cli();
            Ok(())
        }
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
