//! Entry export and the export stream format.
//!
//! [`ExportStream`] walks `dn2id` in key order over one read snapshot, so
//! parents always come before their children and the output can be fed
//! straight back into a bulk load.
//!
//! Stream format: a plain [`ExportHeader`] frame, then a zstd stream of
//! [`ExportFrame`]s, closed by an `End` frame carrying the entry count.

use std::io::{Read, Write};

use dirstore_substrate::{Direction, ReadTxn};
use dirstore_types::{
    Attribute, Dn, Entry,
    codec::{read_frame, write_frame},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    container::{EntryContainer, SubtreeScan},
    error::{CodecSnafu, IoSnafu, Result, corruption},
};

/// Magic bytes at the start of every export stream.
pub const EXPORT_MAGIC: [u8; 4] = *b"DSEX";

/// Current export format version.
pub const EXPORT_VERSION: u16 = 1;

const ZSTD_LEVEL: i32 = 3;

/// Uncompressed stream header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportHeader {
    /// Always [`EXPORT_MAGIC`].
    pub magic: [u8; 4],
    /// Format version.
    pub version: u16,
}

/// One exported entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    /// The entry's DN as a string.
    pub dn: String,
    /// Stored attributes, operational ones included.
    pub attributes: Vec<Attribute>,
}

impl From<&Entry> for ExportRecord {
    fn from(entry: &Entry) -> Self {
        Self { dn: entry.dn().to_string(), attributes: entry.attributes().cloned().collect() }
    }
}

impl ExportRecord {
    /// Rebuilds the entry.
    ///
    /// # Errors
    ///
    /// Returns corruption if the DN does not parse.
    #[allow(clippy::result_large_err)]
    pub fn into_entry(self) -> Result<Entry> {
        let dn = Dn::parse(&self.dn)
            .map_err(|e| corruption(format!("exported DN {:?} does not parse: {e}", self.dn)))?;
        let mut entry = Entry::new(dn);
        for attribute in self.attributes {
            let values = attribute.values().to_vec();
            entry.replace(attribute.name(), values);
        }
        Ok(entry)
    }
}

/// One frame of the compressed stream body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFrame {
    /// An entry.
    Entry(ExportRecord),
    /// End of stream.
    End {
        /// Entries written.
        entries: u64,
    },
}

// ============================================================================
// Export
// ============================================================================

/// Lazy export of every entry, parents before children.
pub struct ExportStream<'b> {
    txn: Box<dyn ReadTxn + 'b>,
    container: &'b EntryContainer,
    base: Option<Vec<u8>>,
    scan: SubtreeScan,
    done: bool,
}

impl std::fmt::Debug for ExportStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportStream").field("done", &self.done).finish_non_exhaustive()
    }
}

impl<'b> ExportStream<'b> {
    pub(crate) fn new(txn: Box<dyn ReadTxn + 'b>, container: &'b EntryContainer) -> Self {
        let base_key = Vec::new();
        let scan = container.subtree_scan(&base_key, Direction::Forward);
        Self { txn, container, base: Some(base_key), scan, done: false }
    }

    #[allow(clippy::result_large_err)]
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let id = match self.base.take() {
            Some(key) => self.container.id_for_key(self.txn.as_ref(), &key)?,
            None => None,
        };
        let id = match id {
            Some(id) => id,
            None => match self.scan.next(self.txn.as_ref())? {
                Some((_, id)) => id,
                None => return Ok(None),
            },
        };
        match self.container.read_entry(self.txn.as_ref(), id)? {
            Some(entry) => Ok(Some(entry)),
            None => Err(corruption(format!("dn2id references missing {id}"))),
        }
    }
}

impl Iterator for ExportStream<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

/// Writes `entries` as an export stream. Returns the number written.
///
/// # Errors
///
/// Returns the first error of `entries`, or a codec or I/O error.
#[allow(clippy::result_large_err)]
pub fn write_export<I, W>(entries: I, writer: W) -> Result<u64>
where
    I: IntoIterator<Item = Result<Entry>>,
    W: Write,
{
    let mut writer = writer;
    write_frame(&mut writer, &ExportHeader { magic: EXPORT_MAGIC, version: EXPORT_VERSION })
        .context(CodecSnafu)?;
    let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL).context(IoSnafu)?;
    let mut count = 0u64;
    for entry in entries {
        let entry = entry?;
        write_frame(&mut encoder, &ExportFrame::Entry(ExportRecord::from(&entry)))
            .context(CodecSnafu)?;
        count += 1;
    }
    write_frame(&mut encoder, &ExportFrame::End { entries: count }).context(CodecSnafu)?;
    encoder.finish().context(IoSnafu)?.flush().context(IoSnafu)?;
    Ok(count)
}

// ============================================================================
// Import stream
// ============================================================================

/// Reads entries back from an export stream.
///
/// Yields an error and stops on a truncated stream, a missing `End` frame or
/// an entry count mismatch.
pub struct ExportReader<R: Read> {
    decoder: zstd::Decoder<'static, std::io::BufReader<R>>,
    read: u64,
    done: bool,
}

impl<R: Read> std::fmt::Debug for ExportReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportReader").field("read", &self.read).field("done", &self.done).finish()
    }
}

#[allow(clippy::result_large_err)]
impl<R: Read> ExportReader<R> {
    /// Checks the header of `reader`.
    ///
    /// # Errors
    ///
    /// Returns corruption for a missing or foreign header, or a codec or I/O error.
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = reader;
        let header: ExportHeader = read_frame(&mut reader)
            .context(CodecSnafu)?
            .ok_or_else(|| corruption("empty export stream"))?;
        if header.magic != EXPORT_MAGIC {
            return Err(corruption("not an entry export stream"));
        }
        if header.version != EXPORT_VERSION {
            return Err(corruption(format!("unsupported export version {}", header.version)));
        }
        let decoder = zstd::Decoder::new(reader).context(IoSnafu)?;
        Ok(Self { decoder, read: 0, done: false })
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let frame: ExportFrame = read_frame(&mut self.decoder)
            .context(CodecSnafu)?
            .ok_or_else(|| corruption("export stream ended without End frame"))?;
        match frame {
            ExportFrame::Entry(record) => {
                self.read += 1;
                record.into_entry().map(Some)
            },
            ExportFrame::End { entries } if entries == self.read => Ok(None),
            ExportFrame::End { entries } => Err(corruption(format!(
                "export stream announced {entries} entries, found {}",
                self.read
            ))),
        }
    }
}

impl<R: Read> Iterator for ExportReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
