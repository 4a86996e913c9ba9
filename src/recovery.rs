//! Rebuild the trailer of unfinished or damaged MCAP files.
//!
//! [`recover`] scans a file's data section record by record, keeping
//! everything up to the first truncated or structurally broken record and
//! reconstructing from it the schemas, channels, chunk indexes and
//! statistics a summary section needs. [`Recovery::rewrite`] then produces a
//! complete, valid, indexed file from the intact prefix.

use std::{borrow::Cow, collections::BTreeMap, collections::HashMap, io::Write, sync::Arc};

use log::{debug, warn};

use crate::{
    channels::ChannelAccumulator,
    compression,
    io_utils::CountingCrcWriter,
    records::{self, op, parse_record, Record, OPCODE_LEN_SIZE},
    write::{write_summary, SummarySections},
    Channel, McapError, McapResult, Schema, MAGIC,
};

/// Everything [`recover`] salvaged from a file's data section.
#[derive(Debug, Default)]
pub struct Recovery {
    pub schemas: HashMap<u16, Arc<Schema<'static>>>,
    pub channels: HashMap<u16, Arc<Channel<'static>>>,
    /// Rebuilt from the chunk records themselves. Message index offsets are
    /// left empty; indexed readers recreate them by scanning each chunk.
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
    pub statistics: records::Statistics,
    /// Offset one past the last intact record: where a fresh DataEnd (and
    /// the rest of a valid trailer) belongs.
    pub data_end_offset: u64,
}

/// What one intact chunk contributes, held back until the whole chunk
/// validates so a torn chunk contributes nothing.
#[derive(Default)]
struct ChunkScan {
    schemas: Vec<(records::SchemaHeader, Vec<u8>)>,
    channels: Vec<records::Channel>,
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
}

impl Recovery {
    /// Writes a complete file: the intact data-section prefix of `data`,
    /// a fresh DataEnd with a recomputed CRC, and a rebuilt summary.
    pub fn rewrite<W: Write>(&self, data: &[u8], out: W) -> McapResult<W> {
        let end: usize = self
            .data_end_offset
            .try_into()
            .map_err(|_| McapError::TooLong(self.data_end_offset))?;
        if data.len() < end {
            return Err(McapError::UnexpectedEof);
        }

        let mut sink = CountingCrcWriter::new(out, true);
        sink.write_all(&data[..end])?;
        let data_section_crc = sink.current_crc().unwrap_or(0);
        records::write_record(
            &mut sink,
            &Record::DataEnd(records::DataEnd { data_section_crc }),
        )?;

        let mut schemas: Vec<_> = self
            .schemas
            .values()
            .map(|schema| {
                (
                    records::SchemaHeader {
                        id: schema.id,
                        name: schema.name.clone(),
                        encoding: schema.encoding.clone(),
                    },
                    schema.data.clone().into_owned(),
                )
            })
            .collect();
        schemas.sort_by_key(|(header, _)| header.id);

        let mut channels: Vec<_> = self
            .channels
            .values()
            .map(|channel| records::Channel {
                id: channel.id,
                schema_id: channel.schema.as_ref().map(|s| s.id).unwrap_or(0),
                topic: channel.topic.clone(),
                message_encoding: channel.message_encoding.clone(),
                metadata: channel.metadata.clone(),
            })
            .collect();
        channels.sort_by_key(|channel| channel.id);

        write_summary(
            &mut sink,
            SummarySections {
                schemas,
                channels,
                metadata_indexes: self.metadata_indexes.clone(),
                attachment_indexes: self.attachment_indexes.clone(),
                chunk_indexes: self.chunk_indexes.clone(),
                statistics: Some(self.statistics.clone()),
            },
            true,
            true,
        )?;
        sink.flush()?;
        Ok(sink.into_inner())
    }
}

/// Scans the data section of a possibly-truncated file.
///
/// Scanning stops cleanly at DataEnd, Footer, end of input, or the first
/// record that doesn't hold together; everything before that point is
/// reported in the returned [`Recovery`].
pub fn recover(data: &[u8]) -> McapResult<Recovery> {
    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(McapError::BadMagic);
    }

    let mut channeler = ChannelAccumulator::default();
    let mut recovery = Recovery::default();
    let mut message_bounds: Option<(u64, u64)> = None;
    let mut channel_message_counts: BTreeMap<u16, u64> = BTreeMap::new();
    let mut chunk_count: u32 = 0;

    let mut pos = MAGIC.len();
    loop {
        let remaining = &data[pos..];
        if remaining.len() < OPCODE_LEN_SIZE {
            break;
        }
        let opcode = remaining[0];
        let Ok(len) = usize::try_from(u64::from_le_bytes(
            remaining[1..OPCODE_LEN_SIZE].try_into().unwrap(),
        )) else {
            break;
        };
        if remaining.len() < OPCODE_LEN_SIZE + len {
            // The record runs past the end of the file: the truncation
            // point. Everything before it stands.
            break;
        }
        if opcode == op::DATA_END || opcode == op::FOOTER {
            break;
        }

        let content = &remaining[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len];
        let result = scan_record(
            opcode,
            content,
            pos as u64,
            len as u64,
            &mut channeler,
            &mut recovery,
            &mut message_bounds,
            &mut channel_message_counts,
            &mut chunk_count,
        );
        if let Err(err) = result {
            warn!("recovery stopped at offset {pos}: {err}");
            break;
        }
        pos += OPCODE_LEN_SIZE + len;
    }

    debug!(
        "recovered {} messages, data section ends at {pos}",
        channel_message_counts.values().sum::<u64>()
    );

    let bounds = message_bounds.unwrap_or((0, 0));
    recovery.statistics = records::Statistics {
        message_count: channel_message_counts.values().sum(),
        schema_count: channeler.schemas.len() as u16,
        channel_count: channeler.channels.len() as u32,
        attachment_count: recovery.attachment_indexes.len() as u32,
        metadata_count: recovery.metadata_indexes.len() as u32,
        chunk_count,
        message_start_time: bounds.0,
        message_end_time: bounds.1,
        channel_message_counts,
    };
    recovery.schemas = channeler.schemas;
    recovery.channels = channeler.channels;
    recovery.data_end_offset = pos as u64;
    Ok(recovery)
}

#[allow(clippy::too_many_arguments)]
fn scan_record(
    opcode: u8,
    content: &[u8],
    offset: u64,
    len: u64,
    channeler: &mut ChannelAccumulator<'static>,
    recovery: &mut Recovery,
    message_bounds: &mut Option<(u64, u64)>,
    channel_message_counts: &mut BTreeMap<u16, u64>,
    chunk_count: &mut u32,
) -> McapResult<()> {
    let widen = |bounds: &mut Option<(u64, u64)>, log_time: u64| {
        *bounds = Some(match *bounds {
            None => (log_time, log_time),
            Some((start, end)) => (start.min(log_time), end.max(log_time)),
        });
    };

    match opcode {
        op::CHUNK => {
            let Record::Chunk { header, data } = parse_record(op::CHUNK, content)? else {
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

            let scan = scan_chunk(&body)?;
            for (schema_header, schema_data) in scan.schemas {
                channeler.add_schema(schema_header, Cow::Owned(schema_data))?;
            }
            for channel in scan.channels {
                channeler.add_channel(channel)?;
            }
            for (channel_id, count) in scan.channel_message_counts {
                *channel_message_counts.entry(channel_id).or_insert(0) += count;
            }
            if let Some((start, end)) = scan.message_bounds {
                widen(message_bounds, start);
                widen(message_bounds, end);
            }

            let chunk_bounds = scan.message_bounds.unwrap_or((0, 0));
            recovery.chunk_indexes.push(records::ChunkIndex {
                message_start_time: chunk_bounds.0,
                message_end_time: chunk_bounds.1,
                chunk_start_offset: offset,
                chunk_length: OPCODE_LEN_SIZE as u64 + len,
                message_index_offsets: BTreeMap::new(),
                message_index_length: 0,
                compression: header.compression,
                compressed_size: header.compressed_size,
                uncompressed_size: header.uncompressed_size,
            });
            *chunk_count += 1;
        }
        op::SCHEMA => {
            let Record::Schema { header, data } = parse_record(op::SCHEMA, content)? else {
                unreachable!("opcode checked above");
            };
            channeler.add_schema(header, Cow::Owned(data.into_owned()))?;
        }
        op::CHANNEL => {
            let Record::Channel(channel) = parse_record(op::CHANNEL, content)? else {
                unreachable!("opcode checked above");
            };
            channeler.add_channel(channel)?;
        }
        op::MESSAGE => {
            let Record::Message { header, .. } = parse_record(op::MESSAGE, content)? else {
                unreachable!("opcode checked above");
            };
            if channeler.get(header.channel_id).is_none() {
                return Err(McapError::UnknownChannel(
                    header.sequence,
                    header.channel_id,
                ));
            }
            widen(message_bounds, header.log_time);
            *channel_message_counts.entry(header.channel_id).or_insert(0) += 1;
        }
        op::ATTACHMENT => {
            let Record::Attachment { header, data, .. } = parse_record(op::ATTACHMENT, content)?
            else {
                unreachable!("opcode checked above");
            };
            recovery.attachment_indexes.push(records::AttachmentIndex {
                offset,
                length: OPCODE_LEN_SIZE as u64 + len,
                log_time: header.log_time,
                create_time: header.create_time,
                data_size: data.len() as u64,
                name: header.name,
                media_type: header.media_type,
            });
        }
        op::METADATA => {
            let Record::Metadata(metadata) = parse_record(op::METADATA, content)? else {
                unreachable!("opcode checked above");
            };
            recovery.metadata_indexes.push(records::MetadataIndex {
                offset,
                length: OPCODE_LEN_SIZE as u64 + len,
                name: metadata.name,
            });
        }
        // Old indexes are superseded by the rebuilt summary, but a record
        // that doesn't even parse marks the end of the trustworthy prefix.
        _ => {
            parse_record(opcode, content)?;
        }
    }
    Ok(())
}

/// Walks a decompressed chunk body, collecting its declarations and message
/// statistics. Nothing is committed by the caller unless the whole chunk
/// holds together.
fn scan_chunk(body: &[u8]) -> McapResult<ChunkScan> {
    let mut scan = ChunkScan::default();
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
        let content = &remaining[OPCODE_LEN_SIZE..OPCODE_LEN_SIZE + len];

        match parse_record(opcode, content)? {
            Record::Schema { header, data } => {
                scan.schemas.push((header, data.into_owned()));
            }
            Record::Channel(channel) => scan.channels.push(channel),
            Record::Message { header, .. } => {
                scan.message_bounds = Some(match scan.message_bounds {
                    None => (header.log_time, header.log_time),
                    Some((start, end)) => {
                        (start.min(header.log_time), end.max(header.log_time))
                    }
                });
                *scan
                    .channel_message_counts
                    .entry(header.channel_id)
                    .or_insert(0) += 1;
            }
            other => return Err(McapError::UnexpectedChunkRecord(other.opcode())),
        }
        offset += OPCODE_LEN_SIZE + len;
    }
    Ok(scan)
}
