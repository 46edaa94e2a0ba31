use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Serial device to open (e.g. /dev/ttyUSB0, COM3).
    pub port: PathBuf,
    /// Baud rate to open the port at.
    #[arg(short, long, default_value_t = 250_000)]
    pub baud: u32,
    /// A single G-code line to send once connected, then exit.
    #[arg(short, long)]
    pub command: Option<String>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
