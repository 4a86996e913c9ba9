//! Read MCAP data from a byte slice.
//!
//! MCAPs are read from a byte slice instead of a [`std::io::Read`] trait
//! object. Consider memory-mapping the file - the OS will load (and cache!)
//! it on demand without further system calls. For incremental sources, use
//! the push-fed [`StreamReader`](crate::stream::StreamReader) directly.

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use binrw::BinRead;
use enumset::{enum_set, EnumSet, EnumSetType};

use crate::{
    channels::ChannelAccumulator,
    records::{self, parse_record, Record, OPCODE_LEN_SIZE},
    stream::{StreamOptions, StreamReader},
    Attachment, Channel, McapError, McapResult, Message, Schema, MAGIC,
};

/// Nonstandard reading options, e.g. to be more lenient when trying to read
/// incomplete or damaged files.
#[derive(EnumSetType, Debug)]
pub enum Options {
    /// Don't require the file to end with its magic bytes.
    IgnoreEndMagic,
}

/// Scans an MCAP byte slice from start to end, yielding each record.
///
/// Chunks are decompressed and their contents yielded record by record; pass
/// [`StreamOptions::with_emit_chunks`] via the stream layer if you need the
/// raw chunks themselves. You probably want a [`MessageStream`] instead -
/// this is mostly a building block for higher-level readers.
pub struct LinearReader<'a> {
    stream: StreamReader,
    buf: &'a [u8],
    fed: bool,
    lenient_eof: bool,
    failed: bool,
}

impl<'a> LinearReader<'a> {
    /// Creates a reader for the given file, checking [`MAGIC`] bytes on both
    /// ends.
    pub fn new(buf: &'a [u8]) -> Self {
        Self::new_with_options(buf, enum_set!())
    }

    /// Creates a reader for the given file with special options.
    pub fn new_with_options(buf: &'a [u8], options: EnumSet<Options>) -> Self {
        let lenient = options.contains(Options::IgnoreEndMagic);
        Self {
            stream: StreamReader::new_with_options(
                StreamOptions::default().with_skip_end_magic(lenient),
            ),
            buf,
            fed: false,
            lenient_eof: lenient,
            failed: false,
        }
    }

    /// Like [`new`](Self::new), but assumes `buf` has the magic bytes
    /// sliced off on both ends.
    ///
    /// Useful for iterating through records in a sub-slice of an MCAP file.
    pub fn sans_magic(buf: &'a [u8]) -> Self {
        Self {
            stream: StreamReader::new_with_options(
                StreamOptions::default()
                    .with_skip_start_magic(true)
                    .with_skip_end_magic(true),
            ),
            buf,
            fed: false,
            lenient_eof: true,
            failed: false,
        }
    }

    /// The schemas and channels declared by records read so far.
    pub fn channels(&self) -> &ChannelAccumulator<'static> {
        self.stream.channels()
    }
}

impl Iterator for LinearReader<'_> {
    type Item = McapResult<Record<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.stream.next_record() {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => {
                    if !self.fed {
                        self.stream.append(self.buf);
                        self.fed = true;
                        continue;
                    }
                    if self.stream.done()
                        || (self.lenient_eof && self.stream.at_record_boundary())
                    {
                        return None;
                    }
                    self.failed = true;
                    return Some(Err(McapError::UnexpectedEof));
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Reads all messages from an MCAP - in the order they were written -
/// wiring each up with its [`Channel`] and performing CRC validation as it
/// goes.
///
/// Because tying each message's lifetime to the underlying slice makes it
/// very difficult to send between threads, and because most messages sit in
/// compressed chunks anyway, yielded [`Message`]s own their data.
pub struct MessageStream<'a> {
    records: LinearReader<'a>,
    done: bool,
}

impl<'a> MessageStream<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::new_with_options(buf, enum_set!())
    }

    pub fn new_with_options(buf: &'a [u8], options: EnumSet<Options>) -> Self {
        Self {
            records: LinearReader::new_with_options(buf, options),
            done: false,
        }
    }
}

impl Iterator for MessageStream<'_> {
    type Item = McapResult<Message<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let record = match self.records.next() {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };
            // Schemas and channels were registered by the reader as they
            // went by; everything except messages is skipped here.
            if let Record::Message { header, data } = record {
                let channel = match self.records.channels().get(header.channel_id) {
                    Some(c) => c,
                    None => {
                        self.done = true;
                        return Some(Err(McapError::UnknownChannel(
                            header.sequence,
                            header.channel_id,
                        )));
                    }
                };
                return Some(Ok(Message {
                    channel,
                    sequence: header.sequence,
                    log_time: header.log_time,
                    publish_time: header.publish_time,
                    data: Cow::Owned(data.into_owned()),
                }));
            }
        }
    }
}

pub(crate) const FOOTER_LEN: usize = 8 // summary start
    + 8 // summary offset start
    + 4; // summary section CRC
pub(crate) const FOOTER_RECORD_LEN: usize = OPCODE_LEN_SIZE + FOOTER_LEN;

/// Reads the MCAP footer, validating the magic bytes on both ends.
///
/// You'd probably prefer [`Summary::read`] to parse the whole summary and
/// then index into the rest of the file with
/// [`IndexedReader`](crate::IndexedReader), [`attachment`], [`metadata`],
/// etc.
pub fn footer(mcap: &[u8]) -> McapResult<records::Footer> {
    // An MCAP must at least fit its two magics and a footer record.
    if mcap.len() < MAGIC.len() + FOOTER_RECORD_LEN + MAGIC.len() {
        return Err(McapError::UnexpectedEof);
    }

    if !mcap.starts_with(MAGIC) || !mcap.ends_with(MAGIC) {
        return Err(McapError::BadMagic);
    }

    let record = &mcap[mcap.len() - MAGIC.len() - FOOTER_RECORD_LEN..];
    if record[0] != records::op::FOOTER {
        return Err(McapError::BadFooter);
    }

    let mut cursor = std::io::Cursor::new(&record[OPCODE_LEN_SIZE..]);
    Ok(records::Footer::read_le(&mut cursor)?)
}

/// Indexes of an MCAP file, parsed from its (optional) summary section.
#[derive(Default, Clone, PartialEq)]
pub struct Summary {
    pub stats: Option<records::Statistics>,
    /// Maps channel IDs to their channel
    pub channels: HashMap<u16, Arc<Channel<'static>>>,
    /// Maps schema IDs to their schema
    pub schemas: HashMap<u16, Arc<Schema<'static>>>,
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
    /// Maps group opcodes to their summary offset, when the file has them.
    pub summary_offsets: HashMap<u8, records::SummaryOffset>,
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep the actual maps as HashMaps for constant-time lookups,
        // but order everything before debug printing it here.
        let channels = self.channels.iter().collect::<BTreeMap<_, _>>();
        let schemas = self.schemas.iter().collect::<BTreeMap<_, _>>();
        let summary_offsets = self.summary_offsets.iter().collect::<BTreeMap<_, _>>();

        f.debug_struct("Summary")
            .field("stats", &self.stats)
            .field("channels", &channels)
            .field("schemas", &schemas)
            .field("chunk_indexes", &self.chunk_indexes)
            .field("attachment_indexes", &self.attachment_indexes)
            .field("metadata_indexes", &self.metadata_indexes)
            .field("summary_offsets", &summary_offsets)
            .finish()
    }
}

impl Summary {
    /// Reads the summary section of the given MCAP slice.
    ///
    /// Returns `Ok(None)` if the file has no summary section
    /// (`Footer.summary_start == 0`). The summary CRC is validated when
    /// nonzero.
    pub fn read(mcap: &[u8]) -> McapResult<Option<Self>> {
        let foot = footer(mcap)?;
        if foot.summary_start == 0 {
            return Ok(None);
        }

        let footer_offset = mcap.len() - MAGIC.len() - FOOTER_RECORD_LEN;
        let summary_start: usize = foot
            .summary_start
            .try_into()
            .map_err(|_| McapError::TooLong(foot.summary_start))?;
        if summary_start > footer_offset {
            return Err(McapError::UnexpectedEof);
        }
        let region = &mcap[summary_start..footer_offset];

        if foot.summary_crc != 0 {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(region);
            // The stored CRC also covers the footer's fixed prefix: opcode,
            // length, summary start and summary offset start.
            hasher.update(&mcap[footer_offset..footer_offset + OPCODE_LEN_SIZE + 16]);
            let calculated = hasher.finalize();
            if calculated != foot.summary_crc {
                return Err(McapError::BadSummaryCrc {
                    saved: foot.summary_crc,
                    calculated,
                });
            }
        }

        parse_summary(region).map(Some)
    }
}

/// Parses the records of a summary region into a [`Summary`].
///
/// Schemas and channels are wired in two phases so no particular group
/// ordering is assumed. Record types that aren't legal in a summary section
/// are rejected; unknown opcodes are skipped.
pub(crate) fn parse_summary(region: &[u8]) -> McapResult<Summary> {
    let mut summary = Summary::default();
    let mut channeler = ChannelAccumulator::default();
    let mut channel_records = Vec::new();

    let mut offset = 0usize;
    while offset < region.len() {
        let remaining = &region[offset..];
        if remaining.len() < OPCODE_LEN_SIZE {
            return Err(McapError::UnexpectedEof);
        }
        let opcode = remaining[0];
        let len = u64::from_le_bytes(remaining[1..OPCODE_LEN_SIZE].try_into().unwrap());
        let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
        if remaining.len() < OPCODE_LEN_SIZE + len {
            return Err(McapError::UnexpectedEof);
        }

        match parse_record(opcode, &remaining[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len])? {
            Record::Schema { header, data } => {
                channeler.add_schema(header, Cow::Owned(data.into_owned()))?;
            }
            Record::Channel(channel) => channel_records.push(channel),
            Record::ChunkIndex(index) => summary.chunk_indexes.push(index),
            Record::AttachmentIndex(index) => summary.attachment_indexes.push(index),
            Record::MetadataIndex(index) => summary.metadata_indexes.push(index),
            Record::Statistics(statistics) => {
                if summary.stats.is_some() {
                    return Err(McapError::DuplicateStatistics);
                }
                summary.stats = Some(statistics);
            }
            Record::SummaryOffset(so) => {
                summary.summary_offsets.insert(so.group_opcode, so);
            }
            Record::Unknown { .. } => {}
            other => return Err(McapError::UnexpectedSummaryRecord(other.opcode())),
        }

        offset += OPCODE_LEN_SIZE + len;
    }

    for channel in channel_records {
        channeler.add_channel(channel)?;
    }
    summary.schemas = channeler.schemas;
    summary.channels = channeler.channels;
    Ok(summary)
}

/// Reads the attachment with the given index.
pub fn attachment<'a>(
    mcap: &'a [u8],
    index: &records::AttachmentIndex,
) -> McapResult<Attachment<'a>> {
    let end = index
        .offset
        .checked_add(index.length)
        .ok_or(McapError::BadIndex)?;
    let end: usize = end.try_into().map_err(|_| McapError::TooLong(end))?;
    if mcap.len() < end {
        return Err(McapError::BadIndex);
    }

    let mut reader = LinearReader::sans_magic(&mcap[index.offset as usize..end]);
    let (h, d) = match reader.next().ok_or(McapError::BadIndex)? {
        Ok(Record::Attachment { header, data, .. }) => (header, data),
        Ok(_other_record) => return Err(McapError::BadIndex),
        Err(e) => return Err(e),
    };

    if reader.next().is_some() {
        // Multiple records in the indexed byte range?
        return Err(McapError::BadIndex);
    }

    Ok(Attachment {
        log_time: h.log_time,
        create_time: h.create_time,
        name: h.name,
        media_type: h.media_type,
        data: Cow::Owned(d.into_owned()),
    })
}

/// Reads the metadata record with the given index.
pub fn metadata(mcap: &[u8], index: &records::MetadataIndex) -> McapResult<records::Metadata> {
    let end = index
        .offset
        .checked_add(index.length)
        .ok_or(McapError::BadIndex)?;
    let end: usize = end.try_into().map_err(|_| McapError::TooLong(end))?;
    if mcap.len() < end {
        return Err(McapError::BadIndex);
    }

    let mut reader = LinearReader::sans_magic(&mcap[index.offset as usize..end]);
    let m = match reader.next().ok_or(McapError::BadIndex)? {
        Ok(Record::Metadata(m)) => m,
        Ok(_other_record) => return Err(McapError::BadIndex),
        Err(e) => return Err(e),
    };

    if reader.next().is_some() {
        return Err(McapError::BadIndex);
    }

    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_needs_magic_on_both_ends() {
        assert!(matches!(footer(&[]), Err(McapError::UnexpectedEof)));

        let mut bogus = Vec::new();
        bogus.extend_from_slice(MAGIC);
        bogus.extend_from_slice(&[0u8; FOOTER_RECORD_LEN]);
        bogus.extend_from_slice(MAGIC);
        // A zeroed footer record has the wrong opcode.
        assert!(matches!(footer(&bogus), Err(McapError::BadFooter)));

        let mut ok = Vec::new();
        ok.extend_from_slice(MAGIC);
        ok.push(records::op::FOOTER);
        ok.extend_from_slice(&(FOOTER_LEN as u64).to_le_bytes());
        ok.extend_from_slice(&[0u8; FOOTER_LEN]);
        ok.extend_from_slice(MAGIC);
        let foot = footer(&ok).expect("footer should parse");
        assert_eq!(foot, records::Footer::default());
    }

    #[test]
    fn summary_read_is_none_without_an_index() {
        let mut unindexed = Vec::new();
        unindexed.extend_from_slice(MAGIC);
        unindexed.push(records::op::FOOTER);
        unindexed.extend_from_slice(&(FOOTER_LEN as u64).to_le_bytes());
        unindexed.extend_from_slice(&[0u8; FOOTER_LEN]);
        unindexed.extend_from_slice(MAGIC);
        assert_eq!(Summary::read(&unindexed).expect("should parse"), None);
    }
}
