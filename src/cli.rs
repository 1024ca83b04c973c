use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use crate::semantic::DevicePreference;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct LibraryArgs {
    /// Catalog listing (`calibredb list --for-machine` output).
    /// Read from stdin when omitted.
    #[clap(short, long)]
    pub library: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Markdown,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Find books by meaning
    Search {
        /// What to look for
        query: String,

        /// Number of results [default: from config]
        #[clap(short = 'n', long)]
        top_n: Option<usize>,

        #[command(flatten)]
        library: LibraryArgs,

        /// Compute device: auto, accelerator or cpu [default: from config]
        #[clap(long)]
        device: Option<DevicePreference>,

        /// Rebuild the embedding cache before searching
        #[clap(long, default_value = "false")]
        force_refresh: bool,
    },

    /// Find duplicate books by title, authors and identifiers
    Duplicates {
        #[command(flatten)]
        library: LibraryArgs,

        /// Minimum title similarity for fuzzy matches [default: from config]
        #[clap(short, long)]
        threshold: Option<f64>,

        #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },

    /// Inspect or remove the embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show what is cached.
    /// With a library, also tell whether the next search would rebuild.
    Status {
        #[clap(short, long)]
        library: Option<PathBuf>,
    },

    /// Delete the cached embeddings
    Clear,
}
