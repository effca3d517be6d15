mod info;
mod monitor;

use std::io::stderr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show summary information for a dictionary snapshot file.
    Info {
        /// Dictionary snapshot (JSON)
        dict: PathBuf,
    },
    /// Channelize DSN monitor SFDUs from a file and dump the resulting
    /// latest-value table as CSV.
    ///
    /// The input file holds one or more MON SFDUs back to back; records
    /// are framed by their NJPL label markers. The dictionary snapshot
    /// must carry the CHDO field table of the station configuration.
    Monitor {
        /// Dictionary snapshot (JSON) including chdo_fields
        #[arg(short, long)]
        dict: PathBuf,

        /// Process only envelopes from this station
        #[arg(short, long)]
        station: Option<u16>,

        /// Output CSV path; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Delete output file if it already exists
        #[arg(long, action)]
        clobber: bool,

        /// Input file of MON SFDUs
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(EnvFilter::try_from_env("EHA_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match &cli.command {
        Commands::Info { dict } => info::info(dict),
        Commands::Monitor {
            dict,
            station,
            output,
            clobber,
            input,
        } => {
            if let Some(output) = output {
                if !clobber && output.exists() {
                    bail!("{output:?} exists; use --clobber");
                }
            }
            monitor::monitor(dict, *station, output.as_deref(), input)
        }
    }
}
