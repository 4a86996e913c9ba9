//! Write MCAP files
//!
//! The [`Writer`] produces a file in a single forward pass: opening magic and
//! Header, then the data section (chunks or bare records, attachments,
//! metadata), then DataEnd, the summary section and its indexes, the Footer
//! and the closing magic. Nothing is ever seeked back over, so any
//! [`Write`] sink works; offsets and CRCs are tracked as bytes go out.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::{self, Cursor, Write},
};

use bimap::BiHashMap;
use binrw::prelude::*;
use byteorder::{WriteBytesExt, LE};
use log::debug;

use crate::{
    chunk::{ChunkBuilder, ChunkContents},
    compression,
    io_utils::CountingCrcWriter,
    records::{self, op, op_and_len, write_record, Record},
    Attachment, Compression, McapError, McapResult, Message, Schema, MAGIC,
};

pub use records::Metadata;

/// Configuration for a [`Writer`], built up with the `with_*`-style methods.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    profile: String,
    library: String,
    compression: Option<Compression>,
    compression_level: Option<i32>,
    chunk_size: Option<u64>,
    use_chunks: bool,
    use_message_index: bool,
    use_summary: bool,
    use_summary_offsets: bool,
    use_statistics: bool,
    use_chunk_crc: bool,
    use_data_crc: bool,
    use_summary_crc: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            profile: String::new(),
            library: format!("mcapio-{}", env!("CARGO_PKG_VERSION")),
            compression: None,
            compression_level: None,
            chunk_size: Some(4 * 1024 * 1024),
            use_chunks: true,
            use_message_index: true,
            use_summary: true,
            use_summary_offsets: true,
            use_statistics: true,
            use_chunk_crc: true,
            use_data_crc: true,
            use_summary_crc: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the profile that should be written to the Header record.
    pub fn profile<S: Into<String>>(self, profile: S) -> Self {
        Self {
            profile: profile.into(),
            ..self
        }
    }

    /// Specifies the library string written to the Header record.
    pub fn library<S: Into<String>>(self, library: S) -> Self {
        Self {
            library: library.into(),
            ..self
        }
    }

    /// Specifies the compression used on chunks.
    pub fn compression(self, compression: Option<Compression>) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Specifies the compression level passed to the codec.
    /// `None` uses the codec's default.
    pub fn compression_level(self, compression_level: Option<i32>) -> Self {
        Self {
            compression_level,
            ..self
        }
    }

    /// Specifies the target uncompressed size of each chunk.
    ///
    /// A chunk is closed once it grows past this size. If `None`, chunks
    /// only close on [`Writer::flush`] or [`Writer::finish`].
    pub fn chunk_size(self, chunk_size: Option<u64>) -> Self {
        Self { chunk_size, ..self }
    }

    /// Specifies whether messages are grouped into chunks.
    ///
    /// If `false`, records go straight into the data section. This rules out
    /// compression and message indexing, but spares small embedded systems
    /// the memory of an in-flight chunk buffer.
    pub fn use_chunks(self, use_chunks: bool) -> Self {
        Self { use_chunks, ..self }
    }

    /// Specifies whether MessageIndex records follow each chunk.
    pub fn use_message_index(self, use_message_index: bool) -> Self {
        Self {
            use_message_index,
            ..self
        }
    }

    /// Specifies whether the summary section is written at all.
    /// Without it the file can only be read as a stream.
    pub fn use_summary(self, use_summary: bool) -> Self {
        Self {
            use_summary,
            ..self
        }
    }

    /// Specifies whether SummaryOffset records are written.
    pub fn use_summary_offsets(self, use_summary_offsets: bool) -> Self {
        Self {
            use_summary_offsets,
            ..self
        }
    }

    /// Specifies whether a Statistics record is written to the summary.
    pub fn use_statistics(self, use_statistics: bool) -> Self {
        Self {
            use_statistics,
            ..self
        }
    }

    /// Specifies whether each Chunk record stores the CRC of its
    /// uncompressed contents.
    pub fn use_chunk_crc(self, use_chunk_crc: bool) -> Self {
        Self {
            use_chunk_crc,
            ..self
        }
    }

    /// Specifies whether DataEnd stores a CRC of the whole data section.
    pub fn use_data_crc(self, use_data_crc: bool) -> Self {
        Self {
            use_data_crc,
            ..self
        }
    }

    /// Specifies whether the Footer stores a CRC of the summary section.
    pub fn use_summary_crc(self, use_summary_crc: bool) -> Self {
        Self {
            use_summary_crc,
            ..self
        }
    }

    /// Creates a [`Writer`] which writes to `w` using the given options.
    pub fn create<W: Write>(self, w: W) -> McapResult<Writer<W>> {
        Writer::with_options(w, self)
    }
}

#[derive(Hash, PartialEq, Eq)]
struct ChannelContent<'a> {
    topic: Cow<'a, str>,
    schema_id: u16,
    message_encoding: Cow<'a, str>,
    metadata: Cow<'a, BTreeMap<String, String>>,
}

#[derive(Hash, PartialEq, Eq)]
struct SchemaContent<'a> {
    name: Cow<'a, str>,
    encoding: Cow<'a, str>,
    data: Cow<'a, [u8]>,
}

struct AttachmentState {
    header: records::AttachmentHeader,
    record_offset: u64,
    data_len: u64,
    written: u64,
    /// Runs over the serialized header, the length prefix and the payload -
    /// the range the attachment's own CRC covers.
    hasher: crc32fast::Hasher,
}

/// Writes an MCAP file to the given [sink](Write).
///
/// Call [`finish()`](Self::finish) to write the trailer and check for
/// errors when done; an unfinished writer attempts it on drop, swallowing
/// errors.
pub struct Writer<W: Write> {
    sink: Option<CountingCrcWriter<W>>,
    finished: Option<W>,
    options: WriteOptions,
    chunk: ChunkBuilder,
    schemas: BiHashMap<SchemaContent<'static>, u16>,
    channels: BiHashMap<ChannelContent<'static>, u16>,
    next_schema_id: u16,
    next_channel_id: u16,
    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,
    attachment: Option<AttachmentState>,
    /// Message start and end time, or None if there are no messages yet.
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
    chunk_count: u32,
}

impl<W: Write> Writer<W> {
    pub fn new(writer: W) -> McapResult<Self> {
        Self::with_options(writer, WriteOptions::default())
    }

    fn with_options(writer: W, opts: WriteOptions) -> McapResult<Self> {
        let mut sink = CountingCrcWriter::new(writer, opts.use_data_crc);
        sink.write_all(MAGIC)?;
        write_record(
            &mut sink,
            &Record::Header(records::Header {
                profile: opts.profile.clone(),
                library: opts.library.clone(),
            }),
        )?;

        Ok(Self {
            sink: Some(sink),
            finished: None,
            options: opts,
            chunk: ChunkBuilder::default(),
            schemas: Default::default(),
            channels: Default::default(),
            next_schema_id: 1,
            next_channel_id: 0,
            chunk_indexes: Default::default(),
            attachment_indexes: Default::default(),
            metadata_indexes: Default::default(),
            attachment: None,
            message_bounds: None,
            channel_message_counts: BTreeMap::new(),
            chunk_count: 0,
        })
    }

    /// A sink write error leaves the file in an unknown state, so the writer
    /// refuses all further work afterwards.
    fn guard<T>(&mut self, result: McapResult<T>) -> McapResult<T> {
        if matches!(result, Err(McapError::Io(_))) {
            self.sink = None;
        }
        result
    }

    fn sink(&mut self) -> McapResult<&mut CountingCrcWriter<W>> {
        self.sink.as_mut().ok_or(McapError::WriterFinished)
    }

    fn check_no_attachment(&self) -> McapResult<()> {
        if self.attachment.is_some() {
            return Err(McapError::AttachmentInProgress);
        }
        Ok(())
    }

    /// Adds a schema, returning its ID. If a schema with the same content
    /// was added already, its ID is returned.
    ///
    /// * `name`: an identifier for the schema.
    /// * `encoding`: describes the schema format; an empty string indicates
    ///   no schema is available.
    /// * `data`: the serialized schema content.
    pub fn add_schema(&mut self, name: &str, encoding: &str, data: &[u8]) -> McapResult<u16> {
        if let Some(&id) = self.schemas.get_by_left(&SchemaContent {
            name: name.into(),
            encoding: encoding.into(),
            data: data.into(),
        }) {
            return Ok(id);
        }
        while self.schemas.contains_right(&self.next_schema_id) {
            if self.next_schema_id == u16::MAX {
                return Err(McapError::TooManySchemas);
            }
            self.next_schema_id += 1;
        }
        let id = self.next_schema_id;
        self.next_schema_id += 1;
        let result = self.write_schema(&Schema {
            id,
            name: name.into(),
            encoding: encoding.into(),
            data: Cow::Borrowed(data),
        });
        self.guard(result)?;
        Ok(id)
    }

    fn write_schema(&mut self, schema: &Schema) -> McapResult<()> {
        self.check_no_attachment()?;
        self.schemas.insert(
            SchemaContent {
                name: Cow::Owned(schema.name.clone()),
                encoding: Cow::Owned(schema.encoding.clone()),
                data: Cow::Owned(schema.data.clone().into_owned()),
            },
            schema.id,
        );
        let header = records::SchemaHeader {
            id: schema.id,
            name: schema.name.clone(),
            encoding: schema.encoding.clone(),
        };
        if self.options.use_chunks {
            self.chunk.add_schema(&header, &schema.data)
        } else {
            let record = Record::Schema {
                header,
                data: Cow::Borrowed(&schema.data),
            };
            Ok(write_record(self.sink()?, &record)?)
        }
    }

    /// Adds a channel, returning its ID. If a channel with equivalent
    /// content was added previously, its ID is returned.
    ///
    /// Useful with subsequent calls to
    /// [`write_to_known_channel`](Self::write_to_known_channel).
    ///
    /// * `schema_id`: an id from [`add_schema`](Self::add_schema), or 0 if
    ///   the channel has no schema.
    /// * `topic`: the topic name.
    /// * `message_encoding`: encoding for messages on this channel.
    /// * `metadata`: metadata about this channel.
    pub fn add_channel(
        &mut self,
        schema_id: u16,
        topic: &str,
        message_encoding: &str,
        metadata: &BTreeMap<String, String>,
    ) -> McapResult<u16> {
        if let Some(&id) = self.channels.get_by_left(&ChannelContent {
            topic: Cow::Borrowed(topic),
            schema_id,
            message_encoding: Cow::Borrowed(message_encoding),
            metadata: Cow::Borrowed(metadata),
        }) {
            return Ok(id);
        }
        if schema_id != 0 && self.schemas.get_by_right(&schema_id).is_none() {
            return Err(McapError::UnknownSchema(topic.into(), schema_id));
        }

        while self.channels.contains_right(&self.next_channel_id) {
            if self.next_channel_id == u16::MAX {
                return Err(McapError::TooManyChannels);
            }
            self.next_channel_id += 1;
        }
        let id = self.next_channel_id;
        self.next_channel_id += 1;

        let result = self.write_channel(records::Channel {
            id,
            schema_id,
            topic: topic.into(),
            message_encoding: message_encoding.into(),
            metadata: metadata.clone(),
        });
        self.guard(result)?;
        Ok(id)
    }

    fn write_channel(&mut self, channel: records::Channel) -> McapResult<()> {
        self.check_no_attachment()?;
        self.channels.insert(
            ChannelContent {
                topic: Cow::Owned(channel.topic.clone()),
                schema_id: channel.schema_id,
                message_encoding: Cow::Owned(channel.message_encoding.clone()),
                metadata: Cow::Owned(channel.metadata.clone()),
            },
            channel.id,
        );
        if self.options.use_chunks {
            if self.chunk.has_channel(channel.id) {
                return Ok(());
            }
            self.chunk.add_channel(&channel)
        } else {
            Ok(write_record(self.sink()?, &Record::Channel(channel))?)
        }
    }

    /// Writes the given message (and its channel and schema, if not added
    /// already). The channel and schema IDs in the message are used as-is.
    pub fn write(&mut self, message: &Message) -> McapResult<()> {
        if let Some(schema) = message.channel.schema.as_ref() {
            if schema.id == 0 {
                return Err(McapError::InvalidSchemaId);
            }
            match self.schemas.get_by_right(&schema.id) {
                Some(previous) => {
                    // The message's schema must not conflict with the
                    // content registered under this id earlier.
                    let current = SchemaContent {
                        name: Cow::Borrowed(&schema.name),
                        encoding: Cow::Borrowed(&schema.encoding),
                        data: Cow::Borrowed(&schema.data),
                    };
                    if *previous != current {
                        return Err(McapError::ConflictingSchemas(schema.name.clone()));
                    }
                }
                None => {
                    let schema = schema.as_ref().clone();
                    let result = self.write_schema(&schema);
                    self.guard(result)?;
                }
            }
        }
        let schema_id = match message.channel.schema.as_ref() {
            None => 0,
            Some(schema) => schema.id,
        };
        match self.channels.get_by_right(&message.channel.id) {
            Some(previous) => {
                let current = ChannelContent {
                    topic: Cow::Borrowed(&message.channel.topic),
                    schema_id,
                    message_encoding: Cow::Borrowed(&message.channel.message_encoding),
                    metadata: Cow::Borrowed(&message.channel.metadata),
                };
                if *previous != current {
                    return Err(McapError::ConflictingChannels(
                        message.channel.topic.clone(),
                    ));
                }
            }
            None => {
                let result = self.write_channel(records::Channel {
                    id: message.channel.id,
                    schema_id,
                    topic: message.channel.topic.clone(),
                    message_encoding: message.channel.message_encoding.clone(),
                    metadata: message.channel.metadata.clone(),
                });
                self.guard(result)?;
            }
        }
        let header = records::MessageHeader {
            channel_id: message.channel.id,
            sequence: message.sequence,
            log_time: message.log_time,
            publish_time: message.publish_time,
        };
        self.write_to_known_channel(&header, &message.data)
    }

    /// Writes a message to a channel added earlier, given its ID.
    ///
    /// This skips hash lookups of the channel and schema if you already
    /// added them.
    pub fn write_to_known_channel(
        &mut self,
        header: &records::MessageHeader,
        data: &[u8],
    ) -> McapResult<()> {
        self.check_no_attachment()?;
        if self.channels.get_by_right(&header.channel_id).is_none() {
            return Err(McapError::UnknownChannel(
                header.sequence,
                header.channel_id,
            ));
        }

        self.message_bounds = Some(match self.message_bounds {
            None => (header.log_time, header.log_time),
            Some((start, end)) => (start.min(header.log_time), end.max(header.log_time)),
        });
        *self
            .channel_message_counts
            .entry(header.channel_id)
            .or_insert(0) += 1;

        let result = self.write_message_inner(header, data);
        self.guard(result)
    }

    fn write_message_inner(
        &mut self,
        header: &records::MessageHeader,
        data: &[u8],
    ) -> McapResult<()> {
        if !self.options.use_chunks {
            let record = Record::Message {
                header: *header,
                data: Cow::Borrowed(data),
            };
            return Ok(write_record(self.sink()?, &record)?);
        }

        // Chunks are self-contained for streaming: a chunk carries the
        // schema and channel of every message in it, ahead of the first use.
        if !self.chunk.has_channel(header.channel_id) {
            let channel = self
                .channel_record(header.channel_id)
                .expect("channel id was checked above");
            if channel.schema_id != 0 && !self.chunk.has_schema(channel.schema_id) {
                let (schema_header, schema_data) = self
                    .schema_record(channel.schema_id)
                    .ok_or_else(|| McapError::UnknownSchema(channel.topic.clone(), channel.schema_id))?;
                self.chunk.add_schema(&schema_header, &schema_data)?;
            }
            self.chunk.add_channel(&channel)?;
        }
        self.chunk.add_message(header, data)?;

        if let Some(target) = self.options.chunk_size {
            if self.chunk.uncompressed_size() > target {
                self.finish_chunk()?;
            }
        }
        Ok(())
    }

    fn channel_record(&self, id: u16) -> Option<records::Channel> {
        let content = self.channels.get_by_right(&id)?;
        Some(records::Channel {
            id,
            schema_id: content.schema_id,
            topic: content.topic.clone().into_owned(),
            message_encoding: content.message_encoding.clone().into_owned(),
            metadata: content.metadata.clone().into_owned(),
        })
    }

    fn schema_record(&self, id: u16) -> Option<(records::SchemaHeader, Vec<u8>)> {
        let content = self.schemas.get_by_right(&id)?;
        Some((
            records::SchemaHeader {
                id,
                name: content.name.clone().into_owned(),
                encoding: content.encoding.clone().into_owned(),
            },
            content.data.clone().into_owned(),
        ))
    }

    /// Closes the current chunk, if there is one, and flushes the sink.
    ///
    /// Finishing the chunk (rather than just flushing mid-chunk) guarantees
    /// that future readers can stream the file at least up to this point.
    pub fn flush(&mut self) -> McapResult<()> {
        self.check_no_attachment()?;
        let result = (|| -> McapResult<()> {
            self.finish_chunk()?;
            self.sink()?.flush()?;
            Ok(())
        })();
        self.guard(result)
    }

    /// Serializes and writes the in-memory chunk, its message indexes, and
    /// the bookkeeping for its chunk index. A no-op on an empty chunk.
    fn finish_chunk(&mut self) -> McapResult<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let num_messages = self.chunk.num_messages();
        let ChunkContents {
            buf,
            indexes,
            message_bounds,
        } = self.chunk.take();

        let uncompressed_size = buf.len() as u64;
        let uncompressed_crc = if self.options.use_chunk_crc {
            crc32fast::hash(&buf)
        } else {
            0
        };
        let (compression, compressed) = compression::compress(
            buf,
            self.options.compression,
            self.options.compression_level,
        )?;
        let message_bounds = message_bounds.unwrap_or((0, 0));
        let header = records::ChunkHeader {
            message_start_time: message_bounds.0,
            message_end_time: message_bounds.1,
            uncompressed_size,
            uncompressed_crc,
            compression: compression.into(),
            compressed_size: compressed.len() as u64,
        };

        let sink = self.sink.as_mut().ok_or(McapError::WriterFinished)?;
        let chunk_offset = sink.position();
        op_and_len(
            sink,
            op::CHUNK,
            header.serialized_len() + compressed.len() as u64,
        )?;
        let mut header_buf = Vec::new();
        Cursor::new(&mut header_buf).write_le(&header).unwrap();
        sink.write_all(&header_buf)?;
        sink.write_all(&compressed)?;
        let chunk_end = sink.position();

        let mut message_index_offsets: BTreeMap<u16, u64> = BTreeMap::new();
        if self.options.use_message_index {
            for (channel_id, mut entries) in indexes {
                // Entries must be sorted by log time no matter what order
                // the caller produced messages in.
                entries.sort_by_key(|e| (e.log_time, e.offset));
                message_index_offsets.insert(channel_id, sink.position());
                write_record(
                    sink,
                    &Record::MessageIndex(records::MessageIndex {
                        channel_id,
                        records: entries,
                    }),
                )?;
            }
        }
        let message_index_length = sink.position() - chunk_end;

        debug!(
            "chunk closed: {num_messages} messages, {uncompressed_size} bytes ({} compressed as `{compression}`)",
            header.compressed_size,
        );

        if self.options.use_summary {
            self.chunk_indexes.push(records::ChunkIndex {
                message_start_time: header.message_start_time,
                message_end_time: header.message_end_time,
                chunk_start_offset: chunk_offset,
                chunk_length: chunk_end - chunk_offset,
                message_index_offsets,
                message_index_length,
                compression: header.compression,
                compressed_size: header.compressed_size,
                uncompressed_size,
            });
        }
        self.chunk_count += 1;
        Ok(())
    }

    /// Starts writing an attachment.
    ///
    /// This is a low-level API for attachments too large to buffer; for
    /// small ones use [`attach`](Self::attach). The declared length must be
    /// exact: bytes are then streamed in with
    /// [`put_attachment_bytes`](Self::put_attachment_bytes) and the record
    /// closed with [`finish_attachment`](Self::finish_attachment). Until
    /// then, every other write operation fails.
    pub fn start_attachment(
        &mut self,
        attachment_length: u64,
        header: records::AttachmentHeader,
    ) -> McapResult<()> {
        self.check_no_attachment()?;
        let result = self.start_attachment_inner(attachment_length, header);
        self.guard(result)
    }

    fn start_attachment_inner(
        &mut self,
        attachment_length: u64,
        header: records::AttachmentHeader,
    ) -> McapResult<()> {
        self.finish_chunk()?;

        let mut header_buf = Vec::new();
        Cursor::new(&mut header_buf).write_le(&header).unwrap();

        let sink = self.sink.as_mut().ok_or(McapError::WriterFinished)?;
        let record_offset = sink.position();
        op_and_len(
            sink,
            op::ATTACHMENT,
            header_buf.len() as u64
                + 8 // data length prefix
                + attachment_length
                + 4, // crc
        )?;
        sink.write_all(&header_buf)?;
        sink.write_u64::<LE>(attachment_length)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_buf);
        hasher.update(&attachment_length.to_le_bytes());

        self.attachment = Some(AttachmentState {
            header,
            record_offset,
            data_len: attachment_length,
            written: 0,
            hasher,
        });
        Ok(())
    }

    /// Writes bytes to the attachment opened with
    /// [`start_attachment`](Self::start_attachment).
    pub fn put_attachment_bytes(&mut self, bytes: &[u8]) -> McapResult<()> {
        let result = (|| -> McapResult<()> {
            let state = self
                .attachment
                .as_mut()
                .ok_or(McapError::AttachmentNotInProgress)?;
            let space = state.data_len - state.written;
            if bytes.len() as u64 > space {
                return Err(McapError::AttachmentTooLarge {
                    excess: bytes.len() as u64 - space,
                    attachment_length: state.data_len,
                });
            }
            let sink = self.sink.as_mut().ok_or(McapError::WriterFinished)?;
            sink.write_all(bytes)?;
            state.hasher.update(bytes);
            state.written += bytes.len() as u64;
            Ok(())
        })();
        self.guard(result)
    }

    /// Finishes the attachment, writing its CRC and recording its index.
    ///
    /// Closing an attachment short of its declared length poisons the
    /// writer: the record's framing is already on disk and can't be taken
    /// back.
    pub fn finish_attachment(&mut self) -> McapResult<()> {
        if let Some(state) = self.attachment.as_ref() {
            if state.written != state.data_len {
                let err = McapError::AttachmentIncomplete {
                    expected: state.data_len,
                    current: state.written,
                };
                self.sink = None;
                self.attachment = None;
                return Err(err);
            }
        }
        let result = (|| -> McapResult<()> {
            let state = self
                .attachment
                .take()
                .ok_or(McapError::AttachmentNotInProgress)?;
            let sink = self.sink.as_mut().ok_or(McapError::WriterFinished)?;
            sink.write_u32::<LE>(state.hasher.finalize())?;

            self.attachment_indexes.push(records::AttachmentIndex {
                offset: state.record_offset,
                length: sink.position() - state.record_offset,
                log_time: state.header.log_time,
                create_time: state.header.create_time,
                data_size: state.data_len,
                name: state.header.name,
                media_type: state.header.media_type,
            });
            Ok(())
        })();
        self.guard(result)
    }

    /// Writes an attachment. Finishes any current chunk first.
    pub fn attach(&mut self, attachment: &Attachment) -> McapResult<()> {
        let header = records::AttachmentHeader {
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        };
        self.start_attachment(attachment.data.len() as u64, header)?;
        self.put_attachment_bytes(&attachment.data[..])?;
        self.finish_attachment()?;
        Ok(())
    }

    /// Writes a Metadata record. Finishes any current chunk first.
    pub fn write_metadata(&mut self, metadata: &Metadata) -> McapResult<()> {
        self.check_no_attachment()?;
        let result = (|| -> McapResult<()> {
            self.finish_chunk()?;
            let sink = self.sink.as_mut().ok_or(McapError::WriterFinished)?;
            let offset = sink.position();
            write_record(sink, &Record::Metadata(metadata.clone()))?;
            self.metadata_indexes.push(records::MetadataIndex {
                offset,
                length: sink.position() - offset,
                name: metadata.name.clone(),
            });
            Ok(())
        })();
        self.guard(result)
    }

    /// Finishes any current chunk and writes out the rest of the file:
    /// DataEnd, the summary section, the Footer and closing magic.
    ///
    /// Idempotent; subsequent writes fail with
    /// [`McapError::WriterFinished`].
    pub fn finish(&mut self) -> McapResult<()> {
        if self.finished.is_some() {
            return Ok(());
        }
        let result = self.finish_inner();
        if result.is_err() {
            self.sink = None;
        }
        result
    }

    fn finish_inner(&mut self) -> McapResult<()> {
        self.check_no_attachment()?;
        self.finish_chunk()?;

        let mut sink = self.sink.take().ok_or(McapError::WriterFinished)?;

        // The data section CRC covers everything up to this record's opcode.
        let data_section_crc = if self.options.use_data_crc {
            sink.current_crc().unwrap_or(0)
        } else {
            0
        };
        write_record(&mut sink, &Record::DataEnd(records::DataEnd { data_section_crc }))?;

        let sections = if self.options.use_summary {
            let message_bounds = self.message_bounds.unwrap_or((0, 0));
            let statistics = self.options.use_statistics.then(|| records::Statistics {
                message_count: self.channel_message_counts.values().sum(),
                schema_count: self.schemas.len() as u16,
                channel_count: self.channels.len() as u32,
                attachment_count: self.attachment_indexes.len() as u32,
                metadata_count: self.metadata_indexes.len() as u32,
                chunk_count: self.chunk_count,
                message_start_time: message_bounds.0,
                message_end_time: message_bounds.1,
                channel_message_counts: std::mem::take(&mut self.channel_message_counts),
            });

            let mut schemas: Vec<_> = self
                .schemas
                .iter()
                .map(|(content, &id)| {
                    (
                        records::SchemaHeader {
                            id,
                            name: content.name.clone().into_owned(),
                            encoding: content.encoding.clone().into_owned(),
                        },
                        content.data.clone().into_owned(),
                    )
                })
                .collect();
            schemas.sort_by_key(|(header, _)| header.id);
            let mut channels: Vec<_> = self
                .channels
                .iter()
                .map(|(content, &id)| records::Channel {
                    id,
                    schema_id: content.schema_id,
                    topic: content.topic.clone().into_owned(),
                    message_encoding: content.message_encoding.clone().into_owned(),
                    metadata: content.metadata.clone().into_owned(),
                })
                .collect();
            channels.sort_by_key(|channel| channel.id);

            SummarySections {
                schemas,
                channels,
                metadata_indexes: std::mem::take(&mut self.metadata_indexes),
                attachment_indexes: std::mem::take(&mut self.attachment_indexes),
                chunk_indexes: std::mem::take(&mut self.chunk_indexes),
                statistics,
            }
        } else {
            SummarySections::default()
        };

        write_summary(
            &mut sink,
            sections,
            self.options.use_summary_offsets,
            self.options.use_summary_crc,
        )?;
        sink.flush()?;
        self.finished = Some(sink.into_inner());
        Ok(())
    }

    /// Finishes the file (if [`finish`](Self::finish) hasn't run already)
    /// and returns the underlying sink.
    pub fn into_inner(mut self) -> McapResult<W> {
        self.finish()?;
        self.finished.take().ok_or(McapError::WriterFinished)
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// The contents of a summary section, ready for serialization.
///
/// Shared between [`Writer::finish`], the [amender](crate::append) and
/// [recovery](crate::recovery), which all end a file the same way.
#[derive(Default)]
pub(crate) struct SummarySections {
    pub schemas: Vec<(records::SchemaHeader, Vec<u8>)>,
    pub channels: Vec<records::Channel>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub statistics: Option<records::Statistics>,
}

/// Writes the summary section (group by group, in fixed order), the
/// SummaryOffset records, the Footer and the closing magic.
///
/// The caller has already written DataEnd; `sink`'s position is the summary
/// start. Empty groups get no SummaryOffset; an entirely empty summary is
/// recorded in the Footer as `summary_start == 0`.
pub(crate) fn write_summary<W: Write>(
    sink: &mut CountingCrcWriter<W>,
    sections: SummarySections,
    use_summary_offsets: bool,
    use_summary_crc: bool,
) -> McapResult<()> {
    let summary_start_pos = sink.position();
    sink.restart_crc(use_summary_crc);

    let mut offsets = Vec::new();
    let mut group_start = summary_start_pos;
    let mut posit = |sink: &mut CountingCrcWriter<W>, group_opcode: u8| {
        let end = sink.position();
        if end > group_start {
            offsets.push(records::SummaryOffset {
                group_opcode,
                group_start,
                group_length: end - group_start,
            });
        }
        group_start = end;
    };

    for (header, data) in sections.schemas {
        write_record(
            sink,
            &Record::Schema {
                header,
                data: Cow::Owned(data),
            },
        )?;
    }
    posit(sink, op::SCHEMA);

    for channel in sections.channels {
        write_record(sink, &Record::Channel(channel))?;
    }
    posit(sink, op::CHANNEL);

    for index in sections.metadata_indexes {
        write_record(sink, &Record::MetadataIndex(index))?;
    }
    posit(sink, op::METADATA_INDEX);

    for index in sections.attachment_indexes {
        write_record(sink, &Record::AttachmentIndex(index))?;
    }
    posit(sink, op::ATTACHMENT_INDEX);

    for index in sections.chunk_indexes {
        write_record(sink, &Record::ChunkIndex(index))?;
    }
    posit(sink, op::CHUNK_INDEX);

    if let Some(statistics) = sections.statistics {
        write_record(sink, &Record::Statistics(statistics))?;
    }
    posit(sink, op::STATISTICS);

    let summary_end = sink.position();
    let summary_start = if summary_end > summary_start_pos {
        summary_start_pos
    } else {
        0
    };
    let summary_offset_start = if use_summary_offsets && !offsets.is_empty() {
        summary_end
    } else {
        0
    };
    if use_summary_offsets {
        for offset in offsets {
            write_record(sink, &Record::SummaryOffset(offset))?;
        }
    }

    // The summary CRC includes the footer record itself, up to the CRC
    // field.
    op_and_len(sink, op::FOOTER, records::Footer::CONTENT_LEN)?;
    sink.write_u64::<LE>(summary_start)?;
    sink.write_u64::<LE>(summary_offset_start)?;
    let summary_crc = if use_summary_crc {
        sink.current_crc().unwrap_or(0)
    } else {
        0
    };
    sink.write_u32::<LE>(summary_crc)?;

    sink.write_all(MAGIC)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_all_channel_ids() {
        let file = std::io::Cursor::new(Vec::new());
        let mut writer = Writer::new(file).expect("failed to construct writer");
        let custom_channel = std::sync::Arc::new(crate::Channel {
            id: u16::MAX,
            topic: "chat".into(),
            message_encoding: "json".into(),
            metadata: BTreeMap::new(),
            schema: None,
        });
        writer
            .write(&crate::Message {
                channel: custom_channel.clone(),
                sequence: 0,
                log_time: 0,
                publish_time: 0,
                data: Cow::Owned(Vec::new()),
            })
            .expect("could not write initial channel");
        for i in 0..65535u16 {
            let id = writer
                .add_channel(0, &format!("{i}"), "json", &BTreeMap::new())
                .expect("could not add channel");
            assert_eq!(i, id);
        }
        let Err(too_many) = writer.add_channel(0, "last", "json", &BTreeMap::new()) else {
            panic!("should not be able to add another channel");
        };
        assert!(matches!(too_many, McapError::TooManyChannels));
    }

    #[test]
    fn writes_all_schema_ids() {
        let file = std::io::Cursor::new(Vec::new());
        let mut writer = Writer::new(file).expect("failed to construct writer");
        let custom_channel = std::sync::Arc::new(crate::Channel {
            id: 0,
            topic: "chat".into(),
            message_encoding: "json".into(),
            metadata: BTreeMap::new(),
            schema: Some(std::sync::Arc::new(crate::Schema {
                id: u16::MAX,
                name: "int".into(),
                encoding: "jsonschema".into(),
                data: Cow::Owned(Vec::new()),
            })),
        });
        writer
            .write(&crate::Message {
                channel: custom_channel.clone(),
                sequence: 0,
                log_time: 0,
                publish_time: 0,
                data: Cow::Owned(Vec::new()),
            })
            .expect("could not write initial channel");
        for i in 0..65534u16 {
            let id = writer
                .add_schema(&format!("{i}"), "jsonschema", &[])
                .expect("could not add schema");
            assert_eq!(id, i + 1);
        }
        let Err(too_many) = writer.add_schema("last", "jsonschema", &[]) else {
            panic!("should not be able to add another schema");
        };
        assert!(matches!(too_many, McapError::TooManySchemas));
    }

    #[test]
    fn conflicting_channel_ids_fail_at_write_time() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        let mut write_message = |topic: &str| {
            writer.write(&crate::Message {
                channel: std::sync::Arc::new(crate::Channel {
                    id: 42,
                    topic: topic.into(),
                    schema: None,
                    message_encoding: "json".into(),
                    metadata: BTreeMap::new(),
                }),
                sequence: 0,
                log_time: 0,
                publish_time: 0,
                data: Cow::Owned(Vec::new()),
            })
        };
        write_message("a").expect("first channel should write");
        assert!(matches!(
            write_message("b"),
            Err(McapError::ConflictingChannels(topic)) if topic == "b"
        ));
    }

    /// Fails with `BrokenPipe` after a given number of bytes.
    struct FailAfter {
        remaining: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() > self.remaining {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.remaining -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_errors_poison_the_writer() {
        // Room for the magic, the header and one channel, but not much else.
        let mut writer = WriteOptions::new()
            .use_chunks(false)
            .create(FailAfter { remaining: 128 })
            .unwrap();
        let channel_id = writer.add_channel(0, "chat", "json", &BTreeMap::new()).unwrap();
        let header = records::MessageHeader {
            channel_id,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
        };
        let big = vec![0u8; 1024];
        assert!(matches!(
            writer.write_to_known_channel(&header, &big),
            Err(McapError::Io(_))
        ));
        // Everything afterwards, including finish(), refuses to run.
        assert!(matches!(
            writer.write_to_known_channel(&header, &[]),
            Err(McapError::WriterFinished)
        ));
        assert!(matches!(writer.finish(), Err(McapError::WriterFinished)));
    }

    #[test]
    fn attachment_length_must_be_exact() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .start_attachment(
                4,
                records::AttachmentHeader {
                    log_time: 0,
                    create_time: 0,
                    name: "a".into(),
                    media_type: "text/plain".into(),
                },
            )
            .unwrap();
        writer.put_attachment_bytes(&[1, 2]).unwrap();
        assert!(matches!(
            writer.finish_attachment(),
            Err(McapError::AttachmentIncomplete {
                expected: 4,
                current: 2
            })
        ));
    }

    #[test]
    fn writes_while_attachment_open_are_rejected() {
        let mut writer = Writer::new(std::io::Cursor::new(Vec::new())).unwrap();
        writer
            .start_attachment(
                1,
                records::AttachmentHeader {
                    log_time: 0,
                    create_time: 0,
                    name: "a".into(),
                    media_type: "text/plain".into(),
                },
            )
            .unwrap();
        assert!(matches!(
            writer.add_channel(0, "chat", "json", &BTreeMap::new()),
            Err(McapError::AttachmentInProgress)
        ));
        writer.put_attachment_bytes(&[0]).unwrap();
        writer.finish_attachment().unwrap();
        writer.add_channel(0, "chat", "json", &BTreeMap::new()).unwrap();
    }
}
