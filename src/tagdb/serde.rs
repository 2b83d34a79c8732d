//! Text sidecar codec (spec.md §6.1). Ground: `original_source/futil.h`
//! (`readfield`/`writefield`) and `tagdb.h`'s `tdb_open`/`tdb_flush`.

use std::io::{Read, Write};

use log::warn;

use super::{Entry, EntryKind, Tdb};
use crate::error::Result;

/// Reads one `\n`-terminated, backslash-escaped field. `\0` terminates
/// reading as if EOF had been hit. Returns `Ok(None)` only when the stream
/// was already exhausted before any byte of this field could be read; a
/// field that runs into EOF mid-read (including a lone trailing `\`) is
/// still returned with whatever was accumulated.
fn read_field<R: Read>(r: &mut R) -> std::io::Result<Option<String>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut escaped = false;
    let mut saw_any_byte = false;
    let mut one = [0u8; 1];

    loop {
        let n = r.read(&mut one)?;
        if n == 0 {
            break;
        }
        let c = one[0];
        saw_any_byte = true;
        if c == 0 {
            break;
        }

        if escaped {
            if c != b'\\' && c != b'\n' {
                buf.push(b'\\');
            }
            buf.push(c);
            escaped = false;
        } else if c == b'\\' {
            escaped = true;
        } else if c == b'\n' {
            return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
        } else {
            buf.push(c);
        }
    }

    if escaped {
        buf.push(b'\\');
    }
    if !saw_any_byte {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn write_field<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    for b in s.bytes() {
        if b == b'\\' || b == b'\n' {
            w.write_all(&[b'\\'])?;
        }
        w.write_all(&[b])?;
    }
    w.write_all(b"\n")
}

/// Parses a sidecar stream into a fresh `Tdb`. Tolerant of a tag block
/// repeated across the stream (merged into the existing tag, with a
/// warning) and of a file listed twice within one block (ignored, with a
/// warning).
pub fn open<R: Read>(mut r: R) -> Result<Tdb> {
    let mut tdb = Tdb::new();

    loop {
        let Some(tag_name) = read_field(&mut r)? else {
            break;
        };
        if tag_name.is_empty() {
            continue;
        }

        let tag_id = match tdb.try_insert(&tag_name, EntryKind::Tag) {
            super::TryInsert::Inserted(e) => e.tag_id().unwrap(),
            super::TryInsert::Existed(e) => {
                warn!("tag '{tag_name}' present twice - merging definitions");
                e.tag_id().unwrap()
            }
        };

        loop {
            let Some(file_name) = read_field(&mut r)? else {
                break;
            };
            if file_name.is_empty() {
                break;
            }

            let file_entry = tdb.insert(&file_name, EntryKind::File);
            let already = Tdb::entry_get_tag(file_entry, tag_id);
            if already {
                warn!("relationship {tag_name}->{file_name} present twice - ignoring duplicate");
            } else {
                Tdb::entry_set_tag(tdb.get_mut(&file_name).unwrap(), tag_id, true);
            }
        }
    }

    Ok(tdb)
}

/// Writes the canonical form: tags in unspecified order, files within each
/// tag in unspecified order, every field escaped, a blank line terminating
/// each block. Caller is responsible for truncating/rewinding the
/// destination stream first.
pub fn flush<W: Write>(tdb: &Tdb, mut w: W) -> Result<()> {
    for (tag_name, entry) in tdb.iter() {
        let Entry::Tag { tag_id } = entry else {
            continue;
        };
        write_field(&mut w, tag_name)?;

        for (file_name, file_entry) in tdb.iter() {
            if file_entry.kind() != EntryKind::File {
                continue;
            }
            if Tdb::entry_get_tag(file_entry, *tag_id) {
                write_field(&mut w, file_name)?;
            }
        }

        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn escapes_backslash_and_newline_in_fields() {
        let mut buf = Vec::new();
        write_field(&mut buf, "a\\b\nc").unwrap();
        let mut cur = Cursor::new(buf);
        let field = read_field(&mut cur).unwrap().unwrap();
        assert_eq!(field, "a\\b\nc");
    }

    #[test]
    fn lone_trailing_backslash_is_preserved_literally() {
        let mut cur = Cursor::new(b"foo\\".to_vec());
        let field = read_field(&mut cur).unwrap().unwrap();
        assert_eq!(field, "foo\\");
    }

    #[test]
    fn nul_byte_terminates_like_eof() {
        let mut cur = Cursor::new(b"foo\0bar\n".to_vec());
        let field = read_field(&mut cur).unwrap().unwrap();
        assert_eq!(field, "foo");
    }

    #[test]
    fn duplicate_tag_block_merges_file_assignments() {
        let text = "red\na\n\nred\nb\n\n";
        let tdb = open(Cursor::new(text.as_bytes().to_vec())).unwrap();
        let red_id = tdb.get("red").unwrap().tag_id().unwrap();
        assert!(Tdb::entry_get_tag(tdb.get("a").unwrap(), red_id));
        assert!(Tdb::entry_get_tag(tdb.get("b").unwrap(), red_id));
    }
}
