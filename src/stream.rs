//! The push-fed record reader at the core of MCAP streaming.
//!
//! [`StreamReader`] performs no I/O of its own: feed it bytes with
//! [`append`](StreamReader::append) as they arrive (from a file, a socket, a
//! byte at a time if need be) and pull records out with
//! [`next_record`](StreamReader::next_record), which returns `Ok(None)`
//! whenever more data is needed. Chunks are transparently decompressed and
//! their contents walked record by record.
//!
//! For reading a complete byte slice, the iterators in [`crate::read`] wrap
//! this with less ceremony.

use std::borrow::Cow;

use crate::{
    channels::ChannelAccumulator,
    compression,
    records::{op, parse_record, Record, OPCODE_LEN_SIZE},
    stream_buf::StreamBuf,
    McapError, McapResult, MAGIC,
};

/// Options for [`StreamReader`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Don't expect the MCAP magic at the start of the stream. Useful for
    /// walking a sub-slice of a file, e.g. its summary section.
    pub skip_start_magic: bool,
    /// Consider the stream complete after the Footer record, without
    /// expecting the closing magic.
    pub skip_end_magic: bool,
    /// Yield each raw Chunk record before walking its decompressed contents.
    pub emit_chunks: bool,
    /// Validate chunk CRCs and the data-section CRC. A stored CRC of zero
    /// means "not computed" and is never checked.
    pub validate_crcs: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            skip_start_magic: false,
            skip_end_magic: false,
            emit_chunks: false,
            validate_crcs: true,
        }
    }
}

impl StreamOptions {
    pub fn with_skip_start_magic(mut self, skip_start_magic: bool) -> Self {
        self.skip_start_magic = skip_start_magic;
        self
    }

    pub fn with_skip_end_magic(mut self, skip_end_magic: bool) -> Self {
        self.skip_end_magic = skip_end_magic;
        self
    }

    pub fn with_emit_chunks(mut self, emit_chunks: bool) -> Self {
        self.emit_chunks = emit_chunks;
        self
    }

    pub fn with_validate_crcs(mut self, validate_crcs: bool) -> Self {
        self.validate_crcs = validate_crcs;
        self
    }
}

enum State {
    StartMagic,
    /// Reading top-level records out of the file buffer.
    Record,
    /// Walking the decompressed contents of a chunk.
    InChunk { body: Vec<u8>, pos: usize },
    EndMagic,
    Done,
}

/// Reads an MCAP file from start to end as bytes are pushed in.
///
/// ```no_run
/// use std::io::Read;
///
/// fn print_topics() -> mcapio::McapResult<()> {
///     let mut file = std::fs::File::open("in.mcap")?;
///     let mut reader = mcapio::StreamReader::new();
///     let mut buf = [0u8; 8192];
///     loop {
///         match reader.next_record()? {
///             Some(mcapio::records::Record::Channel(c)) => println!("{}", c.topic),
///             Some(_other) => {}
///             None => {
///                 // The reader needs more data.
///                 let n = file.read(&mut buf)?;
///                 if n == 0 {
///                     break;
///                 }
///                 reader.append(&buf[..n]);
///             }
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct StreamReader {
    options: StreamOptions,
    buf: StreamBuf,
    state: State,
    channeler: ChannelAccumulator<'static>,
    /// With `emit_chunks`, the raw Chunk record waiting to be yielded before
    /// its contents are walked.
    pending_chunk: Option<Record<'static>>,
}

impl Default for StreamReader {
    fn default() -> Self {
        Self::new_with_options(StreamOptions::default())
    }
}

impl StreamReader {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn new_with_options(options: StreamOptions) -> Self {
        StreamReader {
            // The data-section CRC runs from the opening magic, so a stream
            // without one has no meaningful baseline to check against.
            buf: StreamBuf::new(options.validate_crcs && !options.skip_start_magic),
            state: if options.skip_start_magic {
                State::Record
            } else {
                State::StartMagic
            },
            channeler: ChannelAccumulator::default(),
            pending_chunk: None,
            options,
        }
    }

    /// Feeds more bytes into the reader.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.append(bytes);
    }

    /// True once the closing magic (or the Footer, with `skip_end_magic`)
    /// has been consumed.
    pub fn done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// True when the reader sits between records with nothing buffered: the
    /// point at which an EOF is a truncation rather than a torn record.
    pub fn at_record_boundary(&self) -> bool {
        self.buf.len() == 0 && matches!(self.state, State::Record | State::Done)
    }

    /// The schemas and channels declared so far, for wiring messages up to
    /// their channels.
    pub fn channels(&self) -> &ChannelAccumulator<'static> {
        &self.channeler
    }

    /// Returns the next record, or `Ok(None)` if more data is needed.
    ///
    /// Unknown opcodes outside chunks are skipped. Schema, Channel and
    /// Message records are validated against what the file declared earlier;
    /// any other opcode inside a chunk is a structural error.
    pub fn next_record(&mut self) -> McapResult<Option<Record<'static>>> {
        loop {
            if let Some(chunk) = self.pending_chunk.take() {
                return Ok(Some(chunk));
            }
            match &mut self.state {
                State::StartMagic => {
                    let Some(magic) = self.buf.peek(MAGIC.len()) else {
                        return Ok(None);
                    };
                    if magic != MAGIC {
                        return Err(McapError::BadMagic);
                    }
                    self.buf.consume(MAGIC.len());
                    self.state = State::Record;
                }
                State::Record => {
                    let Some(framing) = self.buf.peek(OPCODE_LEN_SIZE) else {
                        return Ok(None);
                    };
                    let opcode = framing[0];
                    let len = u64::from_le_bytes(framing[1..].try_into().unwrap());
                    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
                    if self.buf.len() < OPCODE_LEN_SIZE + len {
                        return Ok(None);
                    }

                    match opcode {
                        op::CHUNK => {
                            let (record, body) = {
                                let content =
                                    &self.buf.consume(OPCODE_LEN_SIZE + len)[OPCODE_LEN_SIZE..];
                                let Record::Chunk { header, data } =
                                    parse_record(op::CHUNK, content)?
                                else {
                                    unreachable!("opcode checked above");
                                };
                                let body = compression::decompress(
                                    &header.compression,
                                    &data,
                                    header.uncompressed_size,
                                )?;
                                let record = self.options.emit_chunks.then(|| Record::Chunk {
                                    header: header.clone(),
                                    data: Cow::Owned(data.into_owned()),
                                });
                                if self.options.validate_crcs && header.uncompressed_crc != 0 {
                                    let calculated = crc32fast::hash(&body);
                                    if calculated != header.uncompressed_crc {
                                        return Err(McapError::BadChunkCrc {
                                            saved: header.uncompressed_crc,
                                            calculated,
                                        });
                                    }
                                }
                                (record, body)
                            };
                            self.state = State::InChunk { body, pos: 0 };
                            self.pending_chunk = record;
                        }
                        op::DATA_END => {
                            // The data-section CRC stops just before this
                            // record's opcode, so the hasher comes out
                            // before the framing is consumed.
                            let calculated = self.buf.hasher.take().map(|h| h.finalize());
                            let record = {
                                let content =
                                    &self.buf.consume(OPCODE_LEN_SIZE + len)[OPCODE_LEN_SIZE..];
                                parse_record(op::DATA_END, content)?.into_owned()
                            };
                            if let (Record::DataEnd(end), Some(calculated)) = (&record, calculated)
                            {
                                let saved = end.data_section_crc;
                                if saved != 0 && saved != calculated {
                                    return Err(McapError::BadDataCrc { saved, calculated });
                                }
                            }
                            return Ok(Some(record));
                        }
                        op::FOOTER => {
                            // The summary CRC is the indexed reader's to
                            // check; it spans a region this reader may not
                            // have started hashing at.
                            self.buf.hasher = None;
                            let record = {
                                let content =
                                    &self.buf.consume(OPCODE_LEN_SIZE + len)[OPCODE_LEN_SIZE..];
                                parse_record(op::FOOTER, content)?.into_owned()
                            };
                            self.state = if self.options.skip_end_magic {
                                State::Done
                            } else {
                                State::EndMagic
                            };
                            return Ok(Some(record));
                        }
                        _ => {
                            let record = {
                                let content =
                                    &self.buf.consume(OPCODE_LEN_SIZE + len)[OPCODE_LEN_SIZE..];
                                parse_record(opcode, content)?.into_owned()
                            };
                            if matches!(record, Record::Unknown { .. }) {
                                continue;
                            }
                            track_declarations(&mut self.channeler, &record)?;
                            return Ok(Some(record));
                        }
                    }
                }
                State::InChunk { body, pos } => {
                    if *pos >= body.len() {
                        self.state = State::Record;
                        continue;
                    }
                    let remaining = &body[*pos..];
                    if remaining.len() < OPCODE_LEN_SIZE {
                        return Err(McapError::UnexpectedEoc);
                    }
                    let opcode = remaining[0];
                    let len = u64::from_le_bytes(remaining[1..OPCODE_LEN_SIZE].try_into().unwrap());
                    let len: usize = len.try_into().map_err(|_| McapError::TooLong(len))?;
                    if remaining.len() < OPCODE_LEN_SIZE + len {
                        return Err(McapError::UnexpectedEoc);
                    }
                    if !matches!(opcode, op::SCHEMA | op::CHANNEL | op::MESSAGE) {
                        return Err(McapError::UnexpectedChunkRecord(opcode));
                    }
                    let record =
                        parse_record(opcode, &remaining[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len])?
                            .into_owned();
                    *pos += OPCODE_LEN_SIZE + len;
                    track_declarations(&mut self.channeler, &record)?;
                    return Ok(Some(record));
                }
                State::EndMagic => {
                    let Some(magic) = self.buf.peek(MAGIC.len()) else {
                        return Ok(None);
                    };
                    if magic != MAGIC {
                        return Err(McapError::BadMagic);
                    }
                    self.buf.consume(MAGIC.len());
                    self.state = State::Done;
                }
                State::Done => {
                    // With skip_end_magic, "done" happens at the Footer and
                    // whatever follows (usually the magic itself) is not
                    // ours to judge.
                    if !self.options.skip_end_magic && self.buf.len() > 0 {
                        return Err(McapError::TrailingBytes(self.buf.len()));
                    }
                    return Ok(None);
                }
            }
        }
    }
}

/// Registers schemas and channels as the file declares them, and rejects
/// messages on channels the file never declared.
fn track_declarations(
    channeler: &mut ChannelAccumulator<'static>,
    record: &Record<'static>,
) -> McapResult<()> {
    match record {
        Record::Schema { header, data } => {
            channeler.add_schema(header.clone(), Cow::Owned(data.clone().into_owned()))
        }
        Record::Channel(chan) => channeler.add_channel(chan.clone()),
        Record::Message { header, .. } => {
            if channeler.get(header.channel_id).is_none() {
                return Err(McapError::UnknownChannel(
                    header.sequence,
                    header.channel_id,
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
