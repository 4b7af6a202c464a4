//! Portable tree dumps.
//!
//! A dump is a consistent copy of every tree of a substrate, independent of
//! the engine that wrote it, so a dump taken from one engine restores into
//! any other.
//!
//! Format: a plain [`DumpHeader`] frame, then a zstd stream of
//! [`DumpRecord`] frames: for each tree, a `Tree` record followed by its
//! pairs in key order, and a closing `End` record carrying the pair count.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use dirstore_types::codec::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    cursor::CursorState,
    error::{CodecSnafu, CorruptedSnafu, IoSnafu, Result},
    substrate::{Direction, KeyRange, Substrate},
};

/// Magic bytes at the start of every dump.
pub const DUMP_MAGIC: [u8; 4] = *b"DSDM";

/// Current dump format version.
pub const DUMP_VERSION: u16 = 1;

const ZSTD_LEVEL: i32 = 3;

/// Pairs written per restore transaction.
const RESTORE_BATCH: usize = 4096;

/// Uncompressed dump header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpHeader {
    /// Always [`DUMP_MAGIC`].
    pub magic: [u8; 4],
    /// Format version.
    pub version: u16,
}

/// One record of the compressed dump body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpRecord {
    /// Subsequent pairs belong to this tree.
    Tree {
        /// Tree name.
        name: String,
    },
    /// A key-value pair.
    Pair {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// End of dump.
    End {
        /// Total pairs written.
        pairs: u64,
    },
}

/// Writes every tree of `substrate` to `writer` from one read snapshot.
///
/// Returns the number of pairs written.
///
/// # Errors
///
/// Returns an engine, codec or I/O error.
pub fn dump<S, W>(substrate: &S, writer: W) -> Result<u64>
where
    S: Substrate + ?Sized,
    W: Write,
{
    let mut writer = writer;
    write_frame(&mut writer, &DumpHeader { magic: DUMP_MAGIC, version: DUMP_VERSION })
        .context(CodecSnafu)?;
    let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL).context(IoSnafu)?;

    let names = substrate.tree_names()?;
    let trees = names.iter().map(|name| substrate.open_tree(name)).collect::<Result<Vec<_>>>()?;
    let txn = substrate.begin_read()?;
    let mut pairs = 0u64;
    for tree in &trees {
        write_frame(&mut encoder, &DumpRecord::Tree { name: tree.name().to_string() })
            .context(CodecSnafu)?;
        let mut cursor = CursorState::new(tree, KeyRange::all(), Direction::Forward);
        while let Some((key, value)) = cursor.next_pair(txn.as_ref())? {
            write_frame(&mut encoder, &DumpRecord::Pair { key, value }).context(CodecSnafu)?;
            pairs += 1;
        }
    }
    write_frame(&mut encoder, &DumpRecord::End { pairs }).context(CodecSnafu)?;
    encoder.finish().context(IoSnafu)?.flush().context(IoSnafu)?;
    tracing::info!(trees = trees.len(), pairs, "dumped substrate");
    Ok(pairs)
}

/// Writes a dump of `substrate` to a new file at `path`.
///
/// # Errors
///
/// Returns an engine, codec or I/O error.
pub fn dump_to_file<S: Substrate + ?Sized>(substrate: &S, path: &Path) -> Result<u64> {
    let file = File::create(path).context(IoSnafu)?;
    dump(substrate, BufWriter::new(file))
}

/// Loads a dump into `substrate`, clearing each dumped tree first.
///
/// Trees absent from the dump are left untouched. Pairs are committed in
/// batches, so a failed restore can leave the target partially loaded.
/// Returns the number of pairs restored.
///
/// # Errors
///
/// Returns `Corrupted` on a bad header, a pair outside any tree, a missing
/// `End` record or a pair count mismatch; otherwise an engine, codec or I/O error.
pub fn restore<S, R>(substrate: &S, reader: R) -> Result<u64>
where
    S: Substrate + ?Sized,
    R: Read,
{
    let mut reader = reader;
    let header: DumpHeader = read_frame(&mut reader)
        .context(CodecSnafu)?
        .ok_or_else(|| CorruptedSnafu { reason: "empty dump" }.build())?;
    if header.magic != DUMP_MAGIC {
        return CorruptedSnafu { reason: "not a substrate dump" }.fail();
    }
    if header.version != DUMP_VERSION {
        return CorruptedSnafu { reason: format!("unsupported dump version {}", header.version) }
            .fail();
    }
    let mut decoder = zstd::Decoder::new(reader).context(IoSnafu)?;

    let mut txn = substrate.begin_write()?;
    let mut current = None;
    let mut pending = 0usize;
    let mut restored = 0u64;
    loop {
        let record: DumpRecord = read_frame(&mut decoder)
            .context(CodecSnafu)?
            .ok_or_else(|| CorruptedSnafu { reason: "dump ended without End record" }.build())?;
        match record {
            DumpRecord::Tree { name } => {
                // Trees are created outside any write transaction.
                txn.commit()?;
                let tree = substrate.open_tree(&name)?;
                txn = substrate.begin_write()?;
                txn.clear(&tree)?;
                pending = 0;
                current = Some(tree);
            },
            DumpRecord::Pair { key, value } => {
                let tree = current
                    .as_ref()
                    .ok_or_else(|| CorruptedSnafu { reason: "pair before any tree" }.build())?;
                txn.put(tree, &key, &value)?;
                restored += 1;
                pending += 1;
                if pending >= RESTORE_BATCH {
                    txn.commit()?;
                    txn = substrate.begin_write()?;
                    pending = 0;
                }
            },
            DumpRecord::End { pairs } => {
                if pairs != restored {
                    return CorruptedSnafu {
                        reason: format!("dump announced {pairs} pairs, found {restored}"),
                    }
                    .fail();
                }
                break;
            },
        }
    }
    txn.commit()?;
    tracing::info!(pairs = restored, "restored substrate dump");
    Ok(restored)
}

/// Loads a dump file written by [`dump_to_file`].
///
/// # Errors
///
/// See [`restore`].
pub fn restore_from_file<S: Substrate + ?Sized>(substrate: &S, path: &Path) -> Result<u64> {
    let file = File::open(path).context(IoSnafu)?;
    restore(substrate, BufReader::new(file))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{MemorySubstrate, SubstrateError};

    fn populated() -> MemorySubstrate {
        let substrate = MemorySubstrate::new();
        let a = substrate.open_tree("a").unwrap();
        let b = substrate.open_tree("b").unwrap();
        substrate.open_tree("empty").unwrap();
        let mut txn = substrate.begin_write().unwrap();
        for i in 0u32..10 {
            txn.put(&a, &i.to_be_bytes(), b"x").unwrap();
        }
        txn.put(&b, b"only", b"y").unwrap();
        txn.commit().unwrap();
        substrate
    }

    #[test]
    fn test_dump_restores_into_fresh_substrate() {
        let source = populated();
        let mut bytes = Vec::new();
        assert_eq!(dump(&source, &mut bytes).unwrap(), 11);

        let target = MemorySubstrate::new();
        assert_eq!(restore(&target, bytes.as_slice()).unwrap(), 11);
        assert_eq!(target.tree_names().unwrap(), vec!["a", "b", "empty"]);
        let a = target.open_tree("a").unwrap();
        let txn = target.begin_read().unwrap();
        assert_eq!(txn.scan(&a, &KeyRange::all(), Direction::Forward, 100).unwrap().len(), 10);
    }

    #[test]
    fn test_restore_replaces_existing_tree_contents() {
        let source = populated();
        let mut bytes = Vec::new();
        dump(&source, &mut bytes).unwrap();

        let target = MemorySubstrate::new();
        let b = target.open_tree("b").unwrap();
        let mut txn = target.begin_write().unwrap();
        txn.put(&b, b"stale", b"z").unwrap();
        txn.commit().unwrap();

        restore(&target, bytes.as_slice()).unwrap();
        let txn = target.begin_read().unwrap();
        assert!(txn.get(&b, b"stale").unwrap().is_none());
        assert!(txn.get(&b, b"only").unwrap().is_some());
    }

    #[test]
    fn test_rejects_foreign_header() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, &DumpHeader { magic: *b"NOPE", version: 1 }).unwrap();
        let err = restore(&MemorySubstrate::new(), bytes.as_slice()).unwrap_err();
        assert!(matches!(err, SubstrateError::Corrupted { .. }));
    }

    #[test]
    fn test_truncated_dump_is_rejected() {
        let source = populated();
        let mut bytes = Vec::new();
        dump(&source, &mut bytes).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(restore(&MemorySubstrate::new(), bytes.as_slice()).is_err());
    }
}
