//! Process arguments

use clap::Parser;

/// Multi-vehicle controller for Anki Drive/Overdrive BLE slot cars.
#[derive(Parser, Debug)]
#[command(name = "drive_fleet", version, about)]
pub struct Cli {
    /// Run without input prompt, reading commands from stdin
    #[arg(short = 'b', long)]
    pub background: bool,
}
