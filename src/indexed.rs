//! Random-access message reading driven by the summary section.
//!
//! [`IndexedReader`] parses a file's [`Summary`] and iterates messages
//! filtered by topic and time range, in log-time order, by merging the
//! per-chunk message indexes with a min-heap of chunk cursors. Chunks are
//! decompressed at most once, on first need, into a cache keyed by their
//! file offset; a chunk's cache entry is dropped as soon as its cursor
//! drains.

use std::{
    borrow::Cow,
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap, HashMap},
    io::Cursor,
    ops::Deref,
};

use binrw::BinRead;

use crate::{
    compression,
    read::Summary,
    records::{self, op, parse_record, Record, OPCODE_LEN_SIZE},
    McapError, McapResult, Message,
};

/// Filters for [`IndexedReader::read_messages`]. Both time bounds are
/// inclusive; `topics: None` means all topics.
#[derive(Debug, Default, Clone)]
pub struct ReadOptions {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub topics: Option<BTreeSet<String>>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yield only messages with `log_time >= start` (inclusive).
    pub fn start_time(mut self, start: u64) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Yield only messages with `log_time <= end` (inclusive).
    pub fn end_time(mut self, end: u64) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Yield only messages on topics matching this set.
    pub fn include_topics<T: IntoIterator<Item = impl Deref<Target = str>>>(
        mut self,
        topics: T,
    ) -> Self {
        self.topics = Some(topics.into_iter().map(|t| t.to_owned()).collect());
        self
    }
}

/// Reads messages from an indexed MCAP slice in log-time order, filtered by
/// topic and time range.
///
/// ```no_run
/// fn tail(mcap: &[u8]) -> mcapio::McapResult<()> {
///     let reader = mcapio::IndexedReader::new(mcap)?;
///     let options = mcapio::ReadOptions::new()
///         .include_topics(["/imu"])
///         .start_time(1_000_000_000);
///     for message in reader.read_messages(options)? {
///         let message = message?;
///         println!("{} @ {}", message.channel.topic, message.log_time);
///     }
///     Ok(())
/// }
/// ```
pub struct IndexedReader<'a> {
    pub summary: Summary,
    mcap: &'a [u8],
}

struct Filter {
    start: Option<u64>,
    end: Option<u64>,
    /// Channel ids resolved from the requested topics; `None` = all.
    channel_ids: Option<BTreeSet<u16>>,
}

/// One chunk's worth of progress through its (merged, filtered, sorted)
/// message index entries. Lazily initialized: entries are read from the file
/// the first time the cursor reaches the top of the heap.
struct ChunkCursor {
    chunk_idx: usize,
    entries: Option<Vec<records::MessageIndexEntry>>,
    pos: usize,
}

/// Heap ordering: next log time first, chunk file offset as the tie-breaker,
/// so overlapping chunks iterate deterministically.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    log_time: u64,
    chunk_offset: u64,
    cursor: usize,
}

impl<'a> IndexedReader<'a> {
    /// Parses the file's summary. Fails with [`McapError::NotIndexed`] if
    /// the footer records no summary section; fall back to
    /// [`MessageStream`](crate::MessageStream) for such files.
    pub fn new(mcap: &'a [u8]) -> McapResult<Self> {
        let summary = Summary::read(mcap)?.ok_or(McapError::NotIndexed)?;
        Ok(Self { summary, mcap })
    }

    /// Uses an already-parsed summary.
    pub fn with_summary(summary: Summary, mcap: &'a [u8]) -> Self {
        Self { summary, mcap }
    }

    /// Iterates messages matching `options`, in non-decreasing log-time
    /// order; ties across chunks go to the chunk earlier in the file.
    pub fn read_messages(&self, options: ReadOptions) -> McapResult<Messages<'_>> {
        let channel_ids = options.topics.as_ref().map(|topics| {
            self.summary
                .channels
                .iter()
                .filter(|(_, channel)| topics.contains(&channel.topic))
                .map(|(&id, _)| id)
                .collect::<BTreeSet<u16>>()
        });
        let filter = Filter {
            start: options.start_time,
            end: options.end_time,
            channel_ids,
        };

        // Keep only chunks whose time range and channels can contribute.
        let chunks: Vec<records::ChunkIndex> = self
            .summary
            .chunk_indexes
            .iter()
            .filter(|index| {
                if let Some(start) = filter.start {
                    if index.message_end_time < start {
                        return false;
                    }
                }
                if let Some(end) = filter.end {
                    if index.message_start_time > end {
                        return false;
                    }
                }
                match &filter.channel_ids {
                    None => true,
                    // Without message indexes there's no per-channel
                    // breakdown to rule the chunk out by.
                    Some(_) if index.message_index_offsets.is_empty() => true,
                    Some(ids) => index
                        .message_index_offsets
                        .keys()
                        .any(|id| ids.contains(id)),
                }
            })
            .cloned()
            .collect();

        let mut heap = BinaryHeap::with_capacity(chunks.len());
        let cursors = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                // Seeded with the chunk's start time: a lower bound for
                // every entry, replaced by the real next-entry time once
                // the cursor is initialized.
                heap.push(Reverse(HeapKey {
                    log_time: chunk.message_start_time,
                    chunk_offset: chunk.chunk_start_offset,
                    cursor: i,
                }));
                ChunkCursor {
                    chunk_idx: i,
                    entries: None,
                    pos: 0,
                }
            })
            .collect();

        Ok(Messages {
            summary: &self.summary,
            mcap: self.mcap,
            chunks,
            cursors,
            heap,
            cache: HashMap::new(),
            filter,
            failed: false,
        })
    }
}

/// Iterator over indexed messages; see [`IndexedReader::read_messages`].
///
/// A malformed chunk or index entry surfaces as an `Err` item and ends the
/// iteration.
pub struct Messages<'m> {
    summary: &'m Summary,
    mcap: &'m [u8],
    chunks: Vec<records::ChunkIndex>,
    cursors: Vec<ChunkCursor>,
    heap: BinaryHeap<Reverse<HeapKey>>,
    /// Decompressed chunk bodies, keyed by chunk file offset.
    cache: HashMap<u64, Vec<u8>>,
    filter: Filter,
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = McapResult<Message<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let Reverse(key) = self.heap.pop()?;
            let cursor = &mut self.cursors[key.cursor];
            let chunk = &self.chunks[cursor.chunk_idx];

            let Some(entries) = cursor.entries.as_ref() else {
                // First visit: load this chunk's message indexes and
                // re-enter the heap with the real next log time.
                let entries =
                    match load_entries(self.mcap, chunk, &self.filter, &mut self.cache) {
                        Ok(entries) => entries,
                        Err(err) => {
                            self.failed = true;
                            return Some(Err(err));
                        }
                    };
                match entries.first() {
                    Some(first) => self.heap.push(Reverse(HeapKey {
                        log_time: first.log_time,
                        chunk_offset: chunk.chunk_start_offset,
                        cursor: key.cursor,
                    })),
                    None => {
                        self.cache.remove(&chunk.chunk_start_offset);
                    }
                }
                cursor.entries = Some(entries);
                continue;
            };

            let entry = entries[cursor.pos];
            cursor.pos += 1;
            let drained = cursor.pos >= entries.len();
            if !drained {
                let next = entries[cursor.pos];
                self.heap.push(Reverse(HeapKey {
                    log_time: next.log_time,
                    chunk_offset: chunk.chunk_start_offset,
                    cursor: key.cursor,
                }));
            }

            let message = read_message_at(self.mcap, chunk, &mut self.cache, self.summary, &entry);
            if drained {
                self.cache.remove(&chunk.chunk_start_offset);
            }
            return match message {
                Ok(message) => Some(Ok(message)),
                Err(err) => {
                    self.failed = true;
                    Some(Err(err))
                }
            };
        }
    }
}

/// Decompresses a chunk into the cache on first use and returns its body.
fn chunk_body<'c>(
    mcap: &[u8],
    chunk: &records::ChunkIndex,
    cache: &'c mut HashMap<u64, Vec<u8>>,
) -> McapResult<&'c Vec<u8>> {
    if !cache.contains_key(&chunk.chunk_start_offset) {
        let body = decompress_chunk(mcap, chunk)?;
        cache.insert(chunk.chunk_start_offset, body);
    }
    Ok(cache
        .get(&chunk.chunk_start_offset)
        .expect("inserted just above"))
}

fn decompress_chunk(mcap: &[u8], chunk: &records::ChunkIndex) -> McapResult<Vec<u8>> {
    let start: usize = chunk
        .chunk_start_offset
        .try_into()
        .map_err(|_| McapError::TooLong(chunk.chunk_start_offset))?;
    let length: usize = chunk
        .chunk_length
        .try_into()
        .map_err(|_| McapError::TooLong(chunk.chunk_length))?;
    let end = start.checked_add(length).ok_or(McapError::BadIndex)?;
    if mcap.len() < end || length < OPCODE_LEN_SIZE {
        return Err(McapError::BadIndex);
    }

    let record = &mcap[start..end];
    if record[0] != op::CHUNK {
        return Err(McapError::BadIndex);
    }
    let len = u64::from_le_bytes(record[1..OPCODE_LEN_SIZE].try_into().unwrap());
    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
    if record.len() < OPCODE_LEN_SIZE + len {
        return Err(McapError::BadIndex);
    }

    let Record::Chunk { header, data } =
        parse_record(op::CHUNK, &record[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len])?
    else {
        unreachable!("opcode checked above");
    };
    let body = compression::decompress(&header.compression, &data, header.uncompressed_size)?;
    if header.uncompressed_crc != 0 {
        let calculated = crc32fast::hash(&body);
        if calculated != header.uncompressed_crc {
            return Err(McapError::BadChunkCrc {
                saved: header.uncompressed_crc,
                calculated,
            });
        }
    }
    Ok(body)
}

/// Reads and merges a chunk's message indexes: one sorted run of entries
/// filtered down to the channels and time range of interest.
///
/// Files written without MessageIndex records fall back to scanning the
/// decompressed chunk.
fn load_entries(
    mcap: &[u8],
    chunk: &records::ChunkIndex,
    filter: &Filter,
    cache: &mut HashMap<u64, Vec<u8>>,
) -> McapResult<Vec<records::MessageIndexEntry>> {
    let mut entries = Vec::new();

    if chunk.message_index_offsets.is_empty() {
        let body = chunk_body(mcap, chunk, cache)?;
        let mut offset = 0usize;
        while offset < body.len() {
            let remaining = &body[offset..];
            if remaining.len() < OPCODE_LEN_SIZE {
                return Err(McapError::UnexpectedEoc);
            }
            let opcode = remaining[0];
            let len = u64::from_le_bytes(remaining[1..OPCODE_LEN_SIZE].try_into().unwrap());
            let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
            if remaining.len() < OPCODE_LEN_SIZE + len {
                return Err(McapError::UnexpectedEoc);
            }
            if opcode == op::MESSAGE {
                let header = records::MessageHeader::read_le(&mut Cursor::new(
                    &remaining[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len],
                ))?;
                if entry_matches(filter, header.channel_id, header.log_time) {
                    entries.push(records::MessageIndexEntry {
                        log_time: header.log_time,
                        offset: offset as u64,
                    });
                }
            }
            offset += OPCODE_LEN_SIZE + len;
        }
        entries.sort_by_key(|e| (e.log_time, e.offset));
        return Ok(entries);
    }

    for (&channel_id, &index_offset) in &chunk.message_index_offsets {
        if let Some(ids) = &filter.channel_ids {
            if !ids.contains(&channel_id) {
                continue;
            }
        }
        let at: usize = index_offset
            .try_into()
            .map_err(|_| McapError::TooLong(index_offset))?;
        if mcap.len() < at + OPCODE_LEN_SIZE || mcap[at] != op::MESSAGE_INDEX {
            return Err(McapError::BadIndex);
        }
        let len = u64::from_le_bytes(mcap[at + 1..at + OPCODE_LEN_SIZE].try_into().unwrap());
        let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
        if mcap.len() < at + OPCODE_LEN_SIZE + len {
            return Err(McapError::BadIndex);
        }
        let Record::MessageIndex(index) = parse_record(
            op::MESSAGE_INDEX,
            &mcap[at + OPCODE_LEN_SIZE..at + OPCODE_LEN_SIZE + len],
        )?
        else {
            unreachable!("opcode checked above");
        };
        if index.channel_id != channel_id {
            return Err(McapError::BadIndex);
        }
        // Entries are sorted by log time (a writer invariant); verify it
        // before leaning on it for the lower bound.
        if index
            .records
            .windows(2)
            .any(|pair| pair[0].log_time > pair[1].log_time)
        {
            return Err(McapError::BadIndex);
        }
        let from = match filter.start {
            Some(start) => index.records.partition_point(|e| e.log_time < start),
            None => 0,
        };
        for entry in &index.records[from..] {
            if let Some(end) = filter.end {
                if entry.log_time > end {
                    break;
                }
            }
            entries.push(*entry);
        }
    }

    entries.sort_by_key(|e| (e.log_time, e.offset));
    Ok(entries)
}

fn entry_matches(filter: &Filter, channel_id: u16, log_time: u64) -> bool {
    if let Some(ids) = &filter.channel_ids {
        if !ids.contains(&channel_id) {
            return false;
        }
    }
    if let Some(start) = filter.start {
        if log_time < start {
            return false;
        }
    }
    if let Some(end) = filter.end {
        if log_time > end {
            return false;
        }
    }
    true
}

/// Parses the Message record an index entry points at, checking that the
/// entry told the truth about what lives there.
fn read_message_at(
    mcap: &[u8],
    chunk: &records::ChunkIndex,
    cache: &mut HashMap<u64, Vec<u8>>,
    summary: &Summary,
    entry: &records::MessageIndexEntry,
) -> McapResult<Message<'static>> {
    let body = chunk_body(mcap, chunk, cache)?;
    let at: usize = entry
        .offset
        .try_into()
        .map_err(|_| McapError::TooLong(entry.offset))?;
    if body.len() < at + OPCODE_LEN_SIZE || body[at] != op::MESSAGE {
        return Err(McapError::BadIndex);
    }
    let len = u64::from_le_bytes(body[at + 1..at + OPCODE_LEN_SIZE].try_into().unwrap());
    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
    if body.len() < at + OPCODE_LEN_SIZE + len {
        return Err(McapError::BadIndex);
    }

    let Record::Message { header, data } = parse_record(
        op::MESSAGE,
        &body[at + OPCODE_LEN_SIZE..at + OPCODE_LEN_SIZE + len],
    )?
    else {
        unreachable!("opcode checked above");
    };
    if header.log_time != entry.log_time {
        return Err(McapError::IndexedTimeMismatch {
            index: entry.log_time,
            actual: header.log_time,
        });
    }
    let channel = summary
        .channels
        .get(&header.channel_id)
        .ok_or(McapError::UnknownChannel(header.sequence, header.channel_id))?
        .clone();

    Ok(Message {
        channel,
        sequence: header.sequence,
        log_time: header.log_time,
        publish_time: header.publish_time,
        data: Cow::Owned(data.into_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Compression, WriteOptions};
    use std::collections::BTreeMap;

    /// Writes one chunk per inner slice; each entry is (channel_id, log_time).
    fn make_mcap(compression: Option<Compression>, chunks: &[&[(u16, u64)]]) -> Vec<u8> {
        let mut writer = WriteOptions::new()
            .compression(compression)
            .chunk_size(None)
            .create(std::io::Cursor::new(Vec::new()))
            .expect("could not make the writer");
        let mut sequence = 0;
        for chunk in chunks.iter() {
            for &(id, log_time) in chunk.iter() {
                writer
                    .write(&crate::Message {
                        channel: std::sync::Arc::new(crate::Channel {
                            id,
                            topic: if id % 2 == 0 {
                                "even".into()
                            } else {
                                "odd".into()
                            },
                            schema: None,
                            message_encoding: "ros1msg".into(),
                            metadata: BTreeMap::new(),
                        }),
                        sequence,
                        log_time,
                        publish_time: log_time,
                        data: std::borrow::Cow::Owned(vec![1, 2, 3]),
                    })
                    .expect("failed write");
                sequence += 1;
            }
            writer.flush().expect("failed to flush chunk");
        }
        writer.finish().expect("failed on finish");
        writer.into_inner().expect("into_inner failed").into_inner()
    }

    fn read_mcap(options: ReadOptions, mcap: &[u8]) -> Vec<(u16, u64)> {
        let reader = IndexedReader::new(mcap).expect("file should be indexed");
        reader
            .read_messages(options)
            .expect("read_messages failed")
            .map(|message| {
                let message = message.expect("message read failed");
                (message.channel.id, message.log_time)
            })
            .collect()
    }

    fn expect_log_time_order(chunks: &[&[(u16, u64)]]) {
        let mcap = make_mcap(None, chunks);
        let mut expected: Vec<(u16, u64)> = chunks.concat();
        // A stable sort by log time: file order breaks ties, which is what
        // the chunk-offset tie-break works out to for in-order chunks.
        expected.sort_by_key(|&(_, log_time)| log_time);
        let found = read_mcap(ReadOptions::new(), &mcap);
        assert_eq!(found, expected);
    }

    #[test]
    fn merges_sequential_chunks() {
        expect_log_time_order(&[
            &[(0, 1), (0, 2), (0, 3)],
            &[(0, 4), (0, 5), (0, 6)],
            &[(0, 7), (0, 8), (0, 9)],
        ]);
    }

    #[test]
    fn merges_overlapping_chunks() {
        expect_log_time_order(&[
            &[(0, 2), (0, 4), (0, 6)],
            &[(1, 1), (1, 3), (1, 5)],
            &[(2, 5), (2, 7), (2, 9)],
        ]);
    }

    #[test]
    fn sorts_disorder_within_a_chunk() {
        expect_log_time_order(&[
            &[(0, 4), (0, 2), (0, 6)],
            &[(1, 5), (1, 3), (1, 1)],
            &[(2, 9), (2, 8), (2, 7)],
        ]);
    }

    #[test]
    fn merges_a_chunk_straddling_many() {
        expect_log_time_order(&[
            &[(0, 1), (0, 10)],
            &[(1, 2), (1, 3)],
            &[(2, 4), (2, 5)],
            &[(3, 6), (3, 7)],
            &[(4, 8), (4, 9)],
        ]);
    }

    #[test]
    fn time_range_is_inclusive_on_both_ends() {
        let mcap = make_mcap(None, &[&[(0, 1), (0, 2), (0, 3), (0, 4), (0, 5), (0, 6)]]);
        let messages = read_mcap(ReadOptions::new().start_time(3).end_time(5), &mcap);
        assert_eq!(&messages, &[(0, 3), (0, 4), (0, 5)]);

        let only_first = read_mcap(ReadOptions::new().end_time(1), &mcap);
        assert_eq!(&only_first, &[(0, 1)]);
        let only_last = read_mcap(ReadOptions::new().start_time(6), &mcap);
        assert_eq!(&only_last, &[(0, 6)]);
    }

    #[test]
    fn topic_filter_selects_matching_channels() {
        let mcap = make_mcap(None, &[&[(0, 1), (1, 2), (2, 3), (1, 4), (0, 5), (1, 6)]]);
        let messages = read_mcap(ReadOptions::new().include_topics(["even"]), &mcap);
        assert_eq!(&messages, &[(0, 1), (2, 3), (0, 5)]);

        let nothing = read_mcap(ReadOptions::new().include_topics(["missing"]), &mcap);
        assert!(nothing.is_empty());
    }

    #[test]
    fn decompresses_every_codec() {
        for compression in [
            None,
            #[cfg(feature = "lz4")]
            Some(Compression::Lz4),
            #[cfg(feature = "zstd")]
            Some(Compression::Zstd),
        ] {
            let mcap = make_mcap(compression, &[&[(0, 1), (0, 2)], &[(0, 3), (0, 4)]]);
            let messages = read_mcap(ReadOptions::new(), &mcap);
            assert_eq!(
                &messages,
                &[(0, 1), (0, 2), (0, 3), (0, 4)],
                "decompression with {compression:?}"
            );
        }
    }

    #[test]
    fn falls_back_to_scanning_without_message_indexes() {
        let mut writer = WriteOptions::new()
            .chunk_size(None)
            .use_message_index(false)
            .create(std::io::Cursor::new(Vec::new()))
            .unwrap();
        let channel = std::sync::Arc::new(crate::Channel {
            id: 0,
            topic: "chat".into(),
            schema: None,
            message_encoding: "json".into(),
            metadata: BTreeMap::new(),
        });
        for (sequence, log_time) in [(0, 3u64), (1, 1), (2, 2)] {
            writer
                .write(&crate::Message {
                    channel: channel.clone(),
                    sequence,
                    log_time,
                    publish_time: log_time,
                    data: Cow::Owned(vec![]),
                })
                .unwrap();
        }
        writer.finish().unwrap();
        let mcap = writer.into_inner().unwrap().into_inner();

        let found = read_mcap(ReadOptions::new(), &mcap);
        assert_eq!(&found, &[(0, 1), (0, 2), (0, 3)]);
    }

    #[test]
    fn unindexed_files_are_refused() {
        let mut writer = WriteOptions::new()
            .use_summary(false)
            .create(std::io::Cursor::new(Vec::new()))
            .unwrap();
        writer.finish().unwrap();
        let mcap = writer.into_inner().unwrap().into_inner();
        assert!(matches!(
            IndexedReader::new(&mcap),
            Err(McapError::NotIndexed)
        ));
    }
}
