//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Multi-queue segmented download engine.
///
/// Downloads are split into parallel byte-range segments when the origin
/// allows, resume from partial on-disk state, and respect per-queue speed,
/// schedule, and quota policies.
#[derive(Parser, Debug)]
#[command(name = "raad")]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one or more URLs and run until every task is terminal.
    Add(AddArgs),
    /// Import a download list (JSON or plain text) and run it.
    Import(ImportArgs),
    /// Export the restored session as a download list.
    Export(ExportArgs),
    /// Print the restored session's download rows.
    List,
}

/// Arguments for `raad add`.
#[derive(ClapArgs, Debug)]
pub struct AddArgs {
    /// URLs to download.
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Target file path (single URL) or target directory.
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Queue to place the downloads in.
    #[arg(long, value_name = "NAME")]
    pub queue: Option<String>,

    /// Category override ("Auto" detects from the filename).
    #[arg(long, value_name = "NAME")]
    pub category: Option<String>,

    /// Number of segments to request per download (1-16).
    #[arg(long, value_name = "N")]
    pub segments: Option<u32>,

    /// Add the downloads paused instead of starting them.
    #[arg(long)]
    pub paused: bool,

    /// Mirror URL for the same content; repeatable, tried in order.
    #[arg(long = "mirror", value_name = "URL")]
    pub mirrors: Vec<String>,

    /// Expected checksum (algorithm detected from its length).
    #[arg(long, value_name = "HEX")]
    pub checksum: Option<String>,

    /// Global speed limit in bytes per second (0 = unlimited).
    #[arg(long, value_name = "BYTES")]
    pub max_speed: Option<u64>,

    /// Global concurrent-download limit.
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,
}

/// Arguments for `raad import`.
#[derive(ClapArgs, Debug)]
pub struct ImportArgs {
    /// List file to import.
    pub path: PathBuf,
}

/// Arguments for `raad export`.
#[derive(ClapArgs, Debug)]
pub struct ExportArgs {
    /// Target file; `.txt` writes bare URLs, anything else JSON.
    pub path: PathBuf,
}
