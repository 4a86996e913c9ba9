use std::collections::{BTreeMap, BTreeSet};

use crate::{
    records::{self, Record},
    McapResult,
};

/// Accumulates one chunk's worth of records in memory.
///
/// Schema, Channel and Message records are appended to an uncompressed
/// buffer; each message also lands in a per-channel index together with the
/// offset of its record in that buffer, and widens the chunk's time bounds.
/// When the writer decides to flush, [`take`](ChunkBuilder::take) hands the
/// buffer and bookkeeping over for compression and serialization.
#[derive(Default)]
pub(crate) struct ChunkBuilder {
    buf: Vec<u8>,
    indexes: BTreeMap<u16, Vec<records::MessageIndexEntry>>,
    message_bounds: Option<(u64, u64)>,
    num_messages: u64,
    schemas_written: BTreeSet<u16>,
    channels_written: BTreeSet<u16>,
}

/// Everything [`ChunkBuilder::take`] yields for one finished chunk.
pub(crate) struct ChunkContents {
    /// The uncompressed record stream.
    pub buf: Vec<u8>,
    /// Per-channel message index entries, in insertion order.
    pub indexes: BTreeMap<u16, Vec<records::MessageIndexEntry>>,
    /// Min and max message log time, or None for a message-free chunk.
    pub message_bounds: Option<(u64, u64)>,
}

impl ChunkBuilder {
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn num_messages(&self) -> u64 {
        self.num_messages
    }

    pub fn has_schema(&self, id: u16) -> bool {
        self.schemas_written.contains(&id)
    }

    pub fn has_channel(&self, id: u16) -> bool {
        self.channels_written.contains(&id)
    }

    pub fn add_schema(&mut self, header: &records::SchemaHeader, data: &[u8]) -> McapResult<()> {
        self.schemas_written.insert(header.id);
        records::write_record(
            &mut self.buf,
            &Record::Schema {
                header: header.clone(),
                data: data.into(),
            },
        )?;
        Ok(())
    }

    /// Appends a Channel record. A given channel id may be added at most
    /// once per chunk; the caller checks [`has_channel`](Self::has_channel).
    pub fn add_channel(&mut self, channel: &records::Channel) -> McapResult<()> {
        debug_assert!(!self.has_channel(channel.id));
        self.channels_written.insert(channel.id);
        records::write_record(&mut self.buf, &Record::Channel(channel.clone()))?;
        Ok(())
    }

    pub fn add_message(&mut self, header: &records::MessageHeader, data: &[u8]) -> McapResult<()> {
        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });
        self.num_messages += 1;

        self.indexes
            .entry(header.channel_id)
            .or_default()
            .push(records::MessageIndexEntry {
                log_time: header.log_time,
                offset: self.buf.len() as u64,
            });

        records::write_record(
            &mut self.buf,
            &Record::Message {
                header: *header,
                data: data.into(),
            },
        )?;
        Ok(())
    }

    /// Yields the accumulated buffer and index snapshots, leaving the
    /// builder reset for the next chunk.
    pub fn take(&mut self) -> ChunkContents {
        let contents = ChunkContents {
            buf: std::mem::take(&mut self.buf),
            indexes: std::mem::take(&mut self.indexes),
            message_bounds: self.message_bounds.take(),
        };
        self.reset();
        contents
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.indexes.clear();
        self.message_bounds = None;
        self.num_messages = 0;
        self.schemas_written.clear();
        self.channels_written.clear();
    }
}
