use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub use crate::config::Config;

pub mod commands;
mod config;
pub mod flash;
pub mod processors;
mod util;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "./config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub commands: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the devices and partitions in the configuration
    Validate,
    /// Wrap a binary into an update package with an image header
    Package(PackageArguments),
    /// Print the header of an update package and check its body
    Inspect {
        /// Update package path (BIN)
        #[arg(short, long, value_name = "INPUT_FILE")]
        input_path: PathBuf,
    },
    /// Generate the reference digest of a bootloader image
    Shadow {
        /// Bootloader image path (ELF or BIN)
        #[arg(short, long, value_name = "INPUT_FILE")]
        input_path: PathBuf,
        /// Output file path (BIN) [default: <INPUT_FILE>.shadow.bin]
        #[arg(short, long, value_name = "OUTPUT_FILE")]
        output_path: Option<PathBuf>,
    },
    /// Run an update cycle against flash dumps, optionally cutting the power
    Simulate(SimulateArguments),
}

#[derive(Args, Debug, Clone)]
pub struct PackageArguments {
    /// Input file path (ELF or BIN)
    #[arg(short, long, value_name = "INPUT_FILE")]
    pub input_path: PathBuf,
    /// Output file path (BIN) [default: <INPUT_FILE>.ota.bin]
    #[arg(short, long, value_name = "OUTPUT_FILE")]
    pub output_path: Option<PathBuf>,
    /// Version string embedded in the header
    #[arg(long, value_name = "VERSION")]
    pub firmware_version: String,
    /// Partition the image is destined for [default: the application role of the configuration]
    #[arg(long, value_name = "PARTITION")]
    pub target: Option<String>,
    /// Build timestamp in seconds since the epoch [default: now]
    #[arg(long, value_name = "SECONDS")]
    pub timestamp: Option<u32>,
}

impl PackageArguments {
    pub fn output_path_with_default(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.input_path.clone().with_extension("ota.bin"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArguments {
    /// Update package to place in the download partition
    #[arg(short, long, value_name = "PACKAGE_FILE")]
    pub package_path: PathBuf,
    /// Directory with a `<device>.bin` dump per flash device, created when missing
    #[arg(short, long, value_name = "DIRECTORY")]
    pub flash_dir: PathBuf,
    /// Cut the power after this many bytes were erased or programmed, then reboot
    #[arg(long, value_name = "BYTES", conflicts_with = "sweep")]
    pub cut_at: Option<u64>,
    /// Instead of a single run, try this many random power cuts and check every outcome
    #[arg(long, value_name = "RUNS")]
    pub sweep: Option<usize>,
    /// Seed for the random power cuts
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Do not write the resulting flash contents back to the dumps
    #[arg(long)]
    pub dry_run: bool,
}
