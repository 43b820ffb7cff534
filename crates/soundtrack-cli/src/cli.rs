use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "soundtrack-cli", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices
    Devices,

    /// Open a file through the stream adapter and print its descriptor
    Probe {
        /// Stream name (a path, resolved against --search-path when set)
        name: String,

        /// Base directory for resolving relative stream names
        #[arg(long)]
        search_path: Option<PathBuf>,

        /// Report a binaural/headphone output profile
        #[arg(long)]
        headphones: bool,
    },

    /// Decode a file and play it on the output device
    ///
    /// Plays at the nearest supported device rate; there is no resampler.
    Play {
        /// Stream name (a path, resolved against --search-path when set)
        name: String,

        /// Base directory for resolving relative stream names
        #[arg(long)]
        search_path: Option<PathBuf>,
    },
}
