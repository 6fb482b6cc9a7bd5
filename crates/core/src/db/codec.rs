//! Blob encoding: zlib compression plus the line-oriented snapshot and
//! patch formats.
//!
//! A snapshot blob is the statement set joined with newlines. A patch blob
//! is a newline-separated list of `"A " + stmt` (addition) and `"D " + stmt`
//! (deletion) lines; the first byte selects the operation, the statement is
//! the suffix from byte 2. Lines are emitted in sorted order so that blob
//! contents, and thereby the compressed lengths the snapshot heuristic
//! reads, are deterministic.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use itertools::Itertools;

use crate::db::store::StatementSet;

/// Compress a blob payload (zlib format).
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a blob payload. Roundtrips [`compress`] exactly.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut buf)?;
    Ok(buf)
}

fn as_utf8(data: &[u8]) -> io::Result<&str> {
    std::str::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encode a snapshot blob payload: all statement lines, sorted.
pub fn encode_snapshot(stmts: &StatementSet) -> Vec<u8> {
    stmts.iter().map(String::as_str).sorted().join("\n").into_bytes()
}

/// Decode a snapshot blob payload back into a statement set.
pub fn decode_snapshot(data: &[u8]) -> io::Result<StatementSet> {
    Ok(as_utf8(data)?.lines().map(str::to_owned).collect())
}

/// Encode a patch blob payload: one `"D "` line per statement present only
/// in `prev`, one `"A "` line per statement present only in `next`.
pub fn encode_patch(prev: &StatementSet, next: &StatementSet) -> Vec<u8> {
    let deletions = prev.difference(next).map(|s| format!("D {s}"));
    let additions = next.difference(prev).map(|s| format!("A {s}"));
    deletions.chain(additions).sorted().join("\n").into_bytes()
}

/// Apply a patch blob payload to `stmts` in place.
///
/// Deleting a statement that is not present is not an error; the line is
/// discarded, as is any line that does not carry an `A` operation marker.
pub fn apply_patch(stmts: &mut StatementSet, data: &[u8]) -> io::Result<()> {
    for line in as_utf8(data)?.lines() {
        let stmt = line.get(2..).unwrap_or_default();
        match line.bytes().next() {
            Some(b'A') => {
                stmts.insert(stmt.to_owned());
            }
            _ => {
                stmts.remove(stmt);
            }
        }
    }
    Ok(())
}

/// Decode a patch blob payload into its `(added, deleted)` statement sets.
pub fn decode_patch(data: &[u8]) -> io::Result<(StatementSet, StatementSet)> {
    let mut added = StatementSet::new();
    let mut deleted = StatementSet::new();
    for line in as_utf8(data)?.lines() {
        let stmt = line.get(2..).unwrap_or_default().to_owned();
        match line.bytes().next() {
            Some(b'A') => {
                added.insert(stmt);
            }
            _ => {
                deleted.insert(stmt);
            }
        }
    }
    Ok((added, deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultTest;
    use pretty_assertions::assert_eq;

    fn set(stmts: &[&str]) -> StatementSet {
        stmts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compress_roundtrip() -> ResultTest<()> {
        let data = b"<a> <p> <b> .\n<a> <p> <c> .";
        assert_eq!(decompress(&compress(data)?)?, data);
        assert_eq!(decompress(&compress(b"")?)?, b"");
        Ok(())
    }

    #[test]
    fn test_snapshot_roundtrip_is_sorted() -> ResultTest<()> {
        let stmts = set(&["<c> <p> <o> .", "<a> <p> <o> .", "<b> <p> <o> ."]);
        let blob = encode_snapshot(&stmts);
        assert_eq!(
            std::str::from_utf8(&blob)?,
            "<a> <p> <o> .\n<b> <p> <o> .\n<c> <p> <o> ."
        );
        assert_eq!(decode_snapshot(&blob)?, stmts);
        Ok(())
    }

    #[test]
    fn test_patch_applies() -> ResultTest<()> {
        let prev = set(&["a .", "b ."]);
        let next = set(&["b .", "c ."]);
        let patch = encode_patch(&prev, &next);
        assert_eq!(std::str::from_utf8(&patch)?, "A c .\nD a .");

        let mut stmts = prev.clone();
        apply_patch(&mut stmts, &patch)?;
        assert_eq!(stmts, next);
        Ok(())
    }

    #[test]
    fn test_patch_deletion_of_absent_statement_is_discarded() -> ResultTest<()> {
        let mut stmts = set(&["a ."]);
        apply_patch(&mut stmts, b"D nonexistent .")?;
        assert_eq!(stmts, set(&["a ."]));
        Ok(())
    }

    #[test]
    fn test_decode_patch() -> ResultTest<()> {
        let (added, deleted) = decode_patch(b"A c .\nD a .\nD b .")?;
        assert_eq!(added, set(&["c ."]));
        assert_eq!(deleted, set(&["a .", "b ."]));
        Ok(())
    }

    #[test]
    fn test_empty_patch_is_identity() -> ResultTest<()> {
        let stmts = set(&["a ."]);
        assert_eq!(encode_patch(&stmts, &stmts), b"");
        let mut applied = stmts.clone();
        apply_patch(&mut applied, b"")?;
        assert_eq!(applied, stmts);
        Ok(())
    }
}
