use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Separator: external tool (demucs CLI)\n",
    "Images:    image 0.25, lofty tags\n",
    "Target:    ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Multi-stem music library engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Library root (overrides `library_dir` from the config file)
    #[arg(short = 'L', long = "library", value_name = "DIR", global = true)]
    pub library: Option<PathBuf>,

    /// Enable debug logging to file (default: stemdeck.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE", global = true)]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR", global = true)]
    pub config_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the library for catalog descriptors and list tracks
    Scan {
        /// Refresh lyrics from `<DIR>/<artist> - <title>.lrc` files
        #[arg(long = "lyrics-dir", value_name = "DIR")]
        lyrics_dir: Option<PathBuf>,

        /// Print the scan report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Split audio files into stems; jobs run one after another
    Split {
        /// Artist name for every file
        #[arg(short = 'a', long)]
        artist: String,

        /// Track title (default: file name without extension)
        #[arg(short = 't', long)]
        title: Option<String>,

        /// Source files or glob patterns
        #[arg(value_name = "FILE", required = true)]
        files: Vec<String>,

        /// Exit when the queue drains instead of waiting for verification
        #[arg(long = "no-verify")]
        no_verify: bool,
    },

    /// Play through the library headless: load each track's stems in order
    Play {
        /// First track index
        #[arg(value_name = "INDEX", default_value = "0")]
        start: usize,

        /// Number of tracks to step through
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Shift all lyric timestamps of a track folder by OFFSET seconds
    ShiftLyrics {
        #[arg(value_name = "FOLDER")]
        folder: PathBuf,

        #[arg(value_name = "OFFSET", allow_hyphen_values = true)]
        offset: f64,
    },

    /// Print effective configuration, cache and memory status
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Write the effective configuration to the config file
        #[arg(long = "save-config")]
        save_config: bool,
    },
}
