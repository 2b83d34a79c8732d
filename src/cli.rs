//! Command-line surface (spec.md §6.3). Ground: teacher's `Args` in
//! `cli.rs`, extended with the config-toggle flags `MountContext`'s
//! `Config` exposes and a log-verbosity pair in the teacher's
//! `setup_logger` style.

use clap::Parser;

/// Mounts a directory of tagged files as a FUSE filesystem.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Where to mount the filesystem
    #[arg(short, long)]
    pub mount_path: String,

    /// Backing directory holding the real files and the `.tagdb` sidecar
    #[arg(short, long)]
    pub source_path: String,

    /// Don't unmount on process exit
    #[arg(short = 'a', long)]
    pub no_unmount: bool,

    /// Disallow root to access the filesystem
    #[arg(short = 'r', long)]
    pub disallow_root: bool,

    /// Don't emit `-tag` entries for tags not fixed by the current query
    #[arg(long)]
    pub no_negated_tags: bool,

    /// Allow creating tags/directories named `.Trash*`
    #[arg(long)]
    pub allow_trash: bool,

    /// Overwrite a renamed file's tags outright instead of merging them
    /// with the destination query's tags
    #[arg(long)]
    pub no_relative_rename: bool,

    /// Write a log file in addition to stderr
    #[arg(short, long)]
    pub log: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}
