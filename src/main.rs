use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::error;

use fml_core::config::{Config, SignatureMethod};
use fml_core::run_analysis;

#[derive(Parser)]
#[command(name = "fml")]
#[command(version)]
#[command(about = "Detect functional-impact bias of somatic mutations in genomic elements", long_about = None)]
struct Cli {
    /// Mutations file (TSV, optionally gzip compressed)
    #[arg(short = 'i', long = "input")]
    mutations: PathBuf,

    /// Genomic elements to analyse (chrom, start, stop, element)
    #[arg(short = 'e', long)]
    elements: PathBuf,

    /// JSON configuration file
    #[arg(short = 'c', long)]
    config: PathBuf,

    /// Output directory
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,

    /// File with one sample id per line to exclude
    #[arg(long = "samples-blacklist")]
    blacklist: Option<PathBuf>,

    /// Signature JSON file, overriding the configuration
    #[arg(long)]
    signature: Option<PathBuf>,

    /// Do not score indels
    #[arg(long)]
    no_indels: bool,

    /// Worker threads (default: all CPUs)
    #[arg(long)]
    cores: Option<usize>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(&cli.config)?;
    if let Some(path) = cli.signature {
        config.signature.method = SignatureMethod::File;
        config.signature.path = Some(path);
    }
    if cli.no_indels {
        config.statistic.indels.include = false;
    }
    if cli.cores.is_some() {
        config.settings.cores = cli.cores;
    }
    if cli.seed.is_some() {
        config.settings.seed = cli.seed;
    }
    config.validate()?;

    run_analysis(&config, &cli.mutations, &cli.elements, &cli.output, cli.blacklist.as_deref())?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
