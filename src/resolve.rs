//! Path resolver & query evaluator (C4). Splits a query path into
//! positive/negative tag masks and resolves the trailing filename
//! component under the disambiguation rules of spec.md §4.4. Ground:
//! `original_source/tagfs.h` (`tagfs_query`, `tagfs_get`, `tagfs_resolve`).

use crate::backing::BackingDir;
use crate::bitset::Bitset;
use crate::error::{Result, TagfsError};
use crate::tagdb::{EntryKind, Tdb};

#[derive(Debug, Clone, Copy)]
pub struct ResolveFlags {
    pub accept_file: bool,
    pub accept_tag: bool,
    pub check_dot: bool,
    pub check_neg: bool,
    pub materialize_real_file: bool,
    pub no_create: bool,
}

impl ResolveFlags {
    /// Used by full path resolution: any kind, dotted and negated tag
    /// names recognized, untracked real files materialized into entries.
    pub const fn full() -> Self {
        Self {
            accept_file: true,
            accept_tag: true,
            check_dot: true,
            check_neg: true,
            materialize_real_file: true,
            no_create: false,
        }
    }

    /// Used while resolving a query token: only exact tag names (query
    /// evaluation handles the dot/neg stripping itself).
    pub const fn tag_exact() -> Self {
        Self {
            accept_file: false,
            accept_tag: true,
            check_dot: false,
            check_neg: false,
            materialize_real_file: false,
            no_create: false,
        }
    }

    /// Used by operations (`mkdir`, `mknod`) that must see whether *any*
    /// entry already owns a name, without the dotted/negated/materialize
    /// fallbacks that full resolution applies.
    pub const fn exact_any() -> Self {
        Self {
            accept_file: true,
            accept_tag: true,
            check_dot: false,
            check_neg: false,
            materialize_real_file: false,
            no_create: false,
        }
    }
}

pub enum NameOutcome {
    Entry(EntryKind),
    /// A real file exists with this name but carries no TDB entry, and
    /// `no_create` was set so none was materialized.
    ExistsUntracked,
    Absent,
}

pub fn is_reserved_name(name: &str) -> bool {
    name == ".tagdb" || name == "." || name == ".."
}

/// Name resolution (spec.md §4.4), steps 1-5.
pub fn resolve_name(
    tdb: &mut Tdb,
    backing: &BackingDir,
    name: &str,
    flags: ResolveFlags,
) -> Result<NameOutcome> {
    if let Some(entry) = tdb.get(name) {
        return match entry.kind() {
            EntryKind::File if flags.accept_file => Ok(NameOutcome::Entry(EntryKind::File)),
            EntryKind::File => Err(TagfsError::NotADirectory),
            EntryKind::Tag if flags.accept_tag => Ok(NameOutcome::Entry(EntryKind::Tag)),
            EntryKind::Tag => Err(TagfsError::IsADirectory),
        };
    }

    if flags.check_dot && flags.accept_tag {
        if let Some(stripped) = name.strip_prefix('.') {
            if matches!(tdb.get(stripped).map(|e| e.kind()), Some(EntryKind::Tag)) {
                return Ok(NameOutcome::Entry(EntryKind::Tag));
            }
        }
    }

    if flags.check_neg && flags.accept_tag {
        if let Some(stripped) = name.strip_prefix('-') {
            if matches!(tdb.get(stripped).map(|e| e.kind()), Some(EntryKind::Tag)) {
                return Ok(NameOutcome::Entry(EntryKind::Tag));
            }
        }
    }

    if flags.materialize_real_file
        && flags.accept_file
        && !is_reserved_name(name)
        && backing.exists(name)?
    {
        if flags.no_create {
            return Ok(NameOutcome::ExistsUntracked);
        }
        tdb.insert(name, EntryKind::File);
        return Ok(NameOutcome::Entry(EntryKind::File));
    }

    Ok(NameOutcome::Absent)
}

fn lookup_tag_negated(tdb: &Tdb, name: &str) -> Result<usize> {
    match tdb.get(name) {
        Some(e) if e.kind() == EntryKind::Tag => Ok(e.tag_id().unwrap()),
        _ => Err(TagfsError::NotFound),
    }
}

fn lookup_tag_positive(tdb: &Tdb, name: &str) -> Result<usize> {
    if let Some(e) = tdb.get(name) {
        if e.kind() == EntryKind::Tag {
            return Ok(e.tag_id().unwrap());
        }
    }
    if let Some(stripped) = name.strip_prefix('.') {
        if let Some(e) = tdb.get(stripped) {
            if e.kind() == EntryKind::Tag {
                return Ok(e.tag_id().unwrap());
            }
        }
    }
    Err(TagfsError::NotFound)
}

/// Applies one query token (spec.md §4.4 steps 1-2) to `pos`/`neg` in
/// place. Used both by `build_query` over a whole path string and, by the
/// FUSE layer, one path component (one `lookup`/`mkdir` call) at a time.
pub fn apply_token(tdb: &Tdb, token: &str, pos: &mut Bitset, neg: &mut Bitset) -> Result<()> {
    if let Some(stripped) = token.strip_prefix('-') {
        let tag_id = lookup_tag_negated(tdb, stripped)?;
        if pos.get(tag_id) {
            return Err(TagfsError::NotFound);
        }
        neg.set(tag_id, true);
    } else {
        let tag_id = lookup_tag_positive(tdb, token)?;
        if neg.get(tag_id) {
            return Err(TagfsError::NotFound);
        }
        pos.set(tag_id, true);
    }
    Ok(())
}

/// Query evaluation (spec.md §4.4): builds the `(pos, neg)` masks for every
/// `/`-separated token in `query`. Fails with `NotFound` if a token names
/// no tag, or if the same tag is asserted both positively and negatively.
pub fn build_query(tdb: &Tdb, query: &str) -> Result<(Bitset, Bitset)> {
    let cap = tdb.tag_capacity();
    let mut pos = Bitset::new(cap);
    let mut neg = Bitset::new(cap);

    for token in query.split('/').filter(|s| !s.is_empty()) {
        apply_token(tdb, token, &mut pos, &mut neg)?;
    }

    Ok((pos, neg))
}

pub struct Resolution {
    pub kind: EntryKind,
    pub filename: String,
}

/// Splits `path` on `/`; the trailing component is the filename, the rest
/// is the query. Returns `(query, filename)` as borrowed slices of `path`
/// with any leading `/` stripped.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

/// Full path resolution (spec.md §4.4, final paragraph). For File entries,
/// verifies membership against the query masks; for the empty trailing
/// component (`path == "/"`), returns the virtual root as a Tag.
pub fn full_resolve(tdb: &mut Tdb, backing: &BackingDir, path: &str) -> Result<Resolution> {
    let (query, filename) = split_path(path);

    if filename.is_empty() || filename == "." || filename == ".." {
        return Ok(Resolution {
            kind: EntryKind::Tag,
            filename: filename.to_string(),
        });
    }
    if filename == ".tagdb" {
        return Err(TagfsError::NotFound);
    }

    let (pos, neg) = build_query(tdb, query)?;
    let cap = tdb.tag_capacity();

    match resolve_name(tdb, backing, filename, ResolveFlags::full())? {
        NameOutcome::Entry(EntryKind::File) => {
            let entry = tdb.get(filename).expect("just resolved");
            let file_tags = entry.file_tags().expect("file entry has file_tags");
            if !file_tags.matches(cap, Some(&pos), Some(&neg)) {
                return Err(TagfsError::NotFound);
            }
            Ok(Resolution {
                kind: EntryKind::File,
                filename: filename.to_string(),
            })
        }
        NameOutcome::Entry(EntryKind::Tag) => Ok(Resolution {
            kind: EntryKind::Tag,
            filename: filename.to_string(),
        }),
        NameOutcome::ExistsUntracked | NameOutcome::Absent => Err(TagfsError::NotFound),
    }
}

/// Validates that `query` (without trailing filename) is satisfiable,
/// without resolving any filename. Used by `mkdir`/`mknod`, which split
/// the query from the new name themselves.
pub fn validate_query(tdb: &Tdb, query: &str) -> Result<(Bitset, Bitset)> {
    build_query(tdb, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagdb::EntryKind as EK;

    fn backing_with(files: &[&str]) -> (tempfile::TempDir, BackingDir) {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            std::fs::write(dir.path().join(f), b"x").unwrap();
        }
        let backing = BackingDir::new(dir.path());
        (dir, backing)
    }

    #[test]
    fn root_resolves_to_tag_with_no_entry() {
        let (_d, backing) = backing_with(&[]);
        let mut tdb = Tdb::new();
        let r = full_resolve(&mut tdb, &backing, "/").unwrap();
        assert_eq!(r.kind, EK::Tag);
    }

    #[test]
    fn file_resolves_under_every_permutation_of_its_tag_subset() {
        let (_d, backing) = backing_with(&["a"]);
        let mut tdb = Tdb::new();
        tdb.insert("red", EK::Tag);
        tdb.insert("blue", EK::Tag);
        tdb.insert("a", EK::File);
        let red_id = tdb.get("red").unwrap().tag_id().unwrap();
        let blue_id = tdb.get("blue").unwrap().tag_id().unwrap();
        crate::tagdb::Tdb::entry_set_tag(tdb.get_mut("a").unwrap(), red_id, true);
        crate::tagdb::Tdb::entry_set_tag(tdb.get_mut("a").unwrap(), blue_id, true);

        for path in ["/red/blue/a", "/blue/red/a", "/red/a", "/blue/a"] {
            let r = full_resolve(&mut tdb, &backing, path).unwrap();
            assert_eq!(r.kind, EK::File, "failed for {path}");
        }
    }

    #[test]
    fn tag_absent_from_file_fails_but_negation_succeeds() {
        let (_d, backing) = backing_with(&["a"]);
        let mut tdb = Tdb::new();
        tdb.insert("red", EK::Tag);
        tdb.insert("green", EK::Tag);
        tdb.insert("a", EK::File);
        let red_id = tdb.get("red").unwrap().tag_id().unwrap();
        crate::tagdb::Tdb::entry_set_tag(tdb.get_mut("a").unwrap(), red_id, true);

        assert!(full_resolve(&mut tdb, &backing, "/green/a").is_err());
        assert!(full_resolve(&mut tdb, &backing, "/-green/a").is_ok());
    }

    #[test]
    fn tag_and_its_own_negation_is_unsatisfiable() {
        let (_d, backing) = backing_with(&["a"]);
        let mut tdb = Tdb::new();
        tdb.insert("red", EK::Tag);
        tdb.insert("a", EK::File);

        let err = full_resolve(&mut tdb, &backing, "/red/-red/a").unwrap_err();
        assert!(matches!(err, TagfsError::NotFound));
    }

    #[test]
    fn untracked_real_file_is_materialized_on_resolve() {
        let (_d, backing) = backing_with(&["plain"]);
        let mut tdb = Tdb::new();
        let r = full_resolve(&mut tdb, &backing, "/plain").unwrap();
        assert_eq!(r.kind, EK::File);
        assert!(tdb.get("plain").is_some());
    }
}
