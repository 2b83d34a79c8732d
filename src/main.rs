use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use fuser::MountOption;
use log::{error, warn, LevelFilter};
use pretty_env_logger::env_logger::{Builder, Target};

use cli::Args;
use config::Config;
use context::MountContext;
use fs::TagfsFilesystem;
use tagdb::Checked;

mod backing;
mod bitset;
mod cli;
mod config;
mod context;
mod cuckoo;
mod error;
mod fs;
mod resolve;
mod tagdb;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logger(args.log.as_deref(), args.quiet)?;

    let config = Config {
        list_negated_tags: !args.no_negated_tags,
        block_trash_creation: !args.allow_trash,
        relative_rename: !args.no_relative_rename,
    };

    let (ctx, outcome) = MountContext::open(&args.source_path, config)
        .context("failed to open backing directory")?;

    match outcome {
        Checked::Clean => {}
        Checked::Repaired(notes) => {
            for note in &notes {
                warn!("repairing tag database: {note}");
            }
            let backup = backup_sidecar(&ctx).context("failed to back up sidecar before repair")?;
            warn!("backed up original sidecar to {}", backup.display());
            ctx.flush().context("failed to flush repaired sidecar")?;
        }
        Checked::Fatal(reason) => {
            bail!("tag database is inconsistent and cannot be safely mounted: {reason}");
        }
    }

    let mut options = vec![MountOption::FSName("tagfs".to_string())];
    if !args.no_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if !args.disallow_root {
        options.push(MountOption::AllowRoot);
    }

    let ctx = Arc::new(ctx);
    let filesystem = TagfsFilesystem::new(Arc::clone(&ctx));

    fuser::mount2(filesystem, &args.mount_path, &options).context("FUSE mount failed")?;

    if let Err(e) = ctx.flush() {
        error!("failed to flush sidecar on exit: {e}");
    }
    Ok(())
}

/// Copies the on-disk sidecar aside as `.tagdb.YYYY-MM-DD[ (n)]` before a
/// repaired copy overwrites it, so an operator can recover the original if
/// the repair guessed wrong.
fn backup_sidecar(ctx: &MountContext) -> anyhow::Result<PathBuf> {
    let date = chrono::Local::now().format("%Y-%m-%d");
    let root = ctx.backing.root();

    let mut path = root.join(format!(".tagdb.{date}"));
    let mut n = 1;
    while path.exists() {
        n += 1;
        path = root.join(format!(".tagdb.{date} ({n})"));
    }

    std::fs::copy(ctx.sidecar_path(), &path)?;
    Ok(path)
}

/// Installs the logger per spec.md §6.3: `--quiet` and the no-flags default
/// both discard everything, `-l -` routes to stderr, `-l <path>` appends to
/// that file.
fn setup_logger(log_path: Option<&str>, quiet: bool) -> anyhow::Result<()> {
    let mut builder = Builder::new();
    builder.filter_level(if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Debug
    });
    builder.format_timestamp_secs();

    match (quiet, log_path) {
        (true, _) | (false, None) => {
            builder.target(Target::Pipe(Box::new(std::io::sink())));
        }
        (false, Some("-")) => {
            builder.target(Target::Stderr);
        }
        (false, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(path))
                .with_context(|| format!("failed to open log file {path}"))?;
            builder.target(Target::Pipe(Box::new(file)));
        }
    }

    builder.init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::MountContext;

    #[test]
    fn backup_sidecar_copies_to_a_dated_name_and_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = MountContext::open(dir.path(), Config::default()).unwrap();
        std::fs::write(ctx.sidecar_path(), b"red\na\n\n").unwrap();

        let first = backup_sidecar(&ctx).unwrap();
        assert!(first.exists());
        assert_eq!(std::fs::read(&first).unwrap(), b"red\na\n\n");

        let second = backup_sidecar(&ctx).unwrap();
        assert_ne!(first, second, "a second backup on the same day must not overwrite the first");
        assert!(second.exists());
    }
}
