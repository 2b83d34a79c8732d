//! Build/run-time configuration switches (spec.md §6.2). The C original
//! fixes these at compile time via `original_source/config.h`; this crate
//! promotes them to CLI-settable runtime flags (see `cli.rs`), which is an
//! ambient-stack supplement rather than a Non-goal violation.

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// `readdir` also emits a `-name` entry for every tag not fixed by the
    /// current query.
    pub list_negated_tags: bool,
    /// `mkdir` on a name matching `.Trash*` fails with `InvalidArgument`.
    pub block_trash_creation: bool,
    /// Rename semantics: `true` unions/subtracts `file_tags` per the target
    /// path's masks; `false` overwrites `file_tags` with the target's
    /// positive mask outright.
    pub relative_rename: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            list_negated_tags: true,
            block_trash_creation: true,
            relative_rename: true,
        }
    }
}

impl Config {
    pub fn is_blocked_trash_name(&self, name: &str) -> bool {
        self.block_trash_creation && name.starts_with(".Trash")
    }
}
