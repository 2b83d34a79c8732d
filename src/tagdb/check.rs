//! Startup integrity check (spec.md §4.3 "chk"). Ground:
//! `original_source/tagfs.c`'s `tagfs_chk`.

use super::{EntryKind, Tdb};
use crate::backing::{BackingDir, RealKind};
use crate::error::Result;

#[derive(Debug)]
pub enum Checked {
    Clean,
    /// The TDB was mutated to restore consistency; messages describe what
    /// was repaired. The caller is expected to back up the on-disk sidecar
    /// before letting the mount proceed.
    Repaired(Vec<String>),
    /// An inconsistency that can't be safely auto-repaired; the mount must
    /// abort with this diagnostic.
    Fatal(String),
}

fn violates_reserved_name(tdb: &Tdb, name: &str) -> bool {
    if name.starts_with('-') || name.contains('/') || name == ".tagdb" {
        return true;
    }
    if let Some(stripped) = name.strip_prefix('.') {
        if tdb.contains(stripped) {
            return true;
        }
    }
    false
}

/// Validates every invariant in spec.md §3 against the backing directory.
/// File entries missing their backing file are auto-removed (repairable);
/// every other violation is fatal, since the system has no principled way
/// to repair a name collision or a malformed entry on its own.
pub fn check(tdb: &mut Tdb, backing: &BackingDir) -> Result<Checked> {
    let mut repairs = Vec::new();
    let mut fatal: Option<String> = None;

    let snapshot: Vec<(String, EntryKind)> =
        tdb.iter().map(|(n, e)| (n.to_string(), e.kind())).collect();
    let mut to_remove = Vec::new();

    for (name, kind) in &snapshot {
        if violates_reserved_name(tdb, name) {
            fatal.get_or_insert_with(|| {
                format!("entry '{name}' has a reserved or malformed name")
            });
            continue;
        }

        match kind {
            EntryKind::Tag => {
                if backing.exists(name)? {
                    fatal.get_or_insert_with(|| {
                        format!("tag '{name}' conflicts with an existing file of the same name")
                    });
                }
            }
            EntryKind::File => {
                if !backing.exists(name)? {
                    to_remove.push(name.clone());
                    repairs.push(format!(
                        "file entry '{name}' has no backing file; removing stale entry"
                    ));
                }
            }
        }
    }

    for name in &to_remove {
        tdb.remove(name);
    }

    for real_name in backing.list()? {
        if real_name == ".tagdb" || real_name.starts_with(".tagdb.") {
            continue;
        }
        if let Some(RealKind::Directory) = backing.real_kind(&real_name)? {
            fatal.get_or_insert_with(|| {
                format!("backing directory contains a subdirectory '{real_name}'")
            });
            continue;
        }
        if real_name.starts_with('-') {
            fatal.get_or_insert_with(|| {
                format!("real file '{real_name}' begins with '-', which is reserved for negation")
            });
        }
        if let Some(stripped) = real_name.strip_prefix('.') {
            if tdb.get(stripped).map(|e| e.kind()) == Some(EntryKind::Tag) {
                fatal.get_or_insert_with(|| {
                    format!("real file '{real_name}' shadows tag '{stripped}' via its dotted form")
                });
            }
        }
    }

    if let Some(msg) = fatal {
        return Ok(Checked::Fatal(msg));
    }
    if !repairs.is_empty() {
        return Ok(Checked::Repaired(repairs));
    }
    Ok(Checked::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagdb::EntryKind as EK;

    fn tmp_backing() -> (tempfile::TempDir, BackingDir) {
        let dir = tempfile::tempdir().unwrap();
        let backing = BackingDir::new(dir.path());
        (dir, backing)
    }

    #[test]
    fn clean_tdb_with_matching_backing_files_is_clean() {
        let (dir, backing) = tmp_backing();
        std::fs::write(dir.path().join("a"), b"hi").unwrap();
        let mut tdb = Tdb::new();
        tdb.insert("a", EK::File);

        let result = check(&mut tdb, &backing).unwrap();
        assert!(matches!(result, Checked::Clean));
    }

    #[test]
    fn missing_backing_file_is_repaired_by_removing_entry() {
        let (_dir, backing) = tmp_backing();
        let mut tdb = Tdb::new();
        tdb.insert("a", EntryKind::File);

        let result = check(&mut tdb, &backing).unwrap();
        assert!(matches!(result, Checked::Repaired(_)));
        assert!(tdb.get("a").is_none());
    }

    #[test]
    fn tag_shadowed_by_real_file_is_fatal() {
        let (dir, backing) = tmp_backing();
        std::fs::write(dir.path().join("red"), b"hi").unwrap();
        let mut tdb = Tdb::new();
        tdb.insert("red", EntryKind::Tag);

        let result = check(&mut tdb, &backing).unwrap();
        assert!(matches!(result, Checked::Fatal(_)));
    }
}
