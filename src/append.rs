//! Amend finished MCAP files in place.
//!
//! [`Amender`] appends attachments and metadata to an indexed file without
//! touching any byte of its existing data section: the old DataEnd record is
//! overwritten with the new records, a fresh DataEnd goes after them, and the
//! summary section is rebuilt with the merged indexes and bumped statistics.
//! The data-section CRC is continued from the value the old DataEnd stored,
//! so the whole chain stays valid.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use binrw::{BinRead, BinWriterExt};
use crc32fast::Hasher;

use crate::{
    io_utils::CountingCrcWriter,
    read::{parse_summary, Summary, FOOTER_RECORD_LEN},
    records::{self, op, write_record, DataEnd, Record, OPCODE_LEN_SIZE},
    write::{write_summary, Metadata, SummarySections},
    Attachment, McapError, McapResult, MAGIC,
};

/// Appends attachments and metadata to a finished, indexed MCAP file.
///
/// Requires exclusive read/write/seek access for its whole lifetime. The
/// summary CRC of the amended file is nonzero exactly when the original's
/// was; same for the data-section CRC.
pub struct Amender<W: Read + Write + Seek> {
    sink: CountingCrcWriter<W>,
    summary: Summary,
    use_summary_offsets: bool,
    use_summary_crc: bool,
    new_attachment_indexes: Vec<records::AttachmentIndex>,
    new_metadata_indexes: Vec<records::MetadataIndex>,
}

impl<W: Read + Write + Seek> Amender<W> {
    /// Parses the file's footer, summary and DataEnd, then positions the
    /// sink over the DataEnd record, ready to append.
    ///
    /// Fails with [`McapError::NotIndexed`] for files without a summary
    /// section; recover such files first.
    pub fn open(mut rw: W) -> McapResult<Self> {
        let file_size = rw.seek(SeekFrom::End(0))?;
        let trailer_len = FOOTER_RECORD_LEN + MAGIC.len();
        if file_size < (MAGIC.len() + trailer_len) as u64 {
            return Err(McapError::UnexpectedEof);
        }

        rw.seek(SeekFrom::Start(0))?;
        let mut start_magic = [0u8; 8];
        rw.read_exact(&mut start_magic)?;
        if start_magic != *MAGIC {
            return Err(McapError::BadMagic);
        }

        rw.seek(SeekFrom::End(-(trailer_len as i64)))?;
        let mut trailer = vec![0u8; trailer_len];
        rw.read_exact(&mut trailer)?;
        if &trailer[FOOTER_RECORD_LEN..] != MAGIC {
            return Err(McapError::BadMagic);
        }
        if trailer[0] != op::FOOTER {
            return Err(McapError::BadFooter);
        }
        let footer =
            records::Footer::read_le(&mut Cursor::new(&trailer[OPCODE_LEN_SIZE..FOOTER_RECORD_LEN]))?;
        if footer.summary_start == 0 {
            return Err(McapError::NotIndexed);
        }

        let footer_offset = file_size - trailer_len as u64;
        if footer.summary_start > footer_offset {
            return Err(McapError::UnexpectedEof);
        }
        rw.seek(SeekFrom::Start(footer.summary_start))?;
        let mut region = vec![0u8; (footer_offset - footer.summary_start) as usize];
        rw.read_exact(&mut region)?;
        if footer.summary_crc != 0 {
            let mut hasher = Hasher::new();
            hasher.update(&region);
            hasher.update(&trailer[..OPCODE_LEN_SIZE + 16]);
            let calculated = hasher.finalize();
            if calculated != footer.summary_crc {
                return Err(McapError::BadSummaryCrc {
                    saved: footer.summary_crc,
                    calculated,
                });
            }
        }
        let summary = parse_summary(&region)?;

        // The writer puts DataEnd immediately before the summary; anything
        // else there means the file wasn't produced by a conforming writer.
        let data_end_pos = footer
            .summary_start
            .checked_sub(DataEnd::RECORD_LEN)
            .ok_or(McapError::BadIndex)?;
        rw.seek(SeekFrom::Start(data_end_pos))?;
        let mut data_end_buf = [0u8; DataEnd::RECORD_LEN as usize];
        rw.read_exact(&mut data_end_buf)?;
        if data_end_buf[0] != op::DATA_END
            || u64::from_le_bytes(data_end_buf[1..OPCODE_LEN_SIZE].try_into().unwrap()) != 4
        {
            return Err(McapError::BadIndex);
        }
        let old_data_crc =
            u32::from_le_bytes(data_end_buf[OPCODE_LEN_SIZE..].try_into().unwrap());

        rw.seek(SeekFrom::Start(data_end_pos))?;
        Ok(Self {
            sink: CountingCrcWriter::resume(
                rw,
                (old_data_crc != 0).then_some(old_data_crc),
                data_end_pos,
            ),
            summary,
            use_summary_offsets: footer.summary_offset_start != 0,
            use_summary_crc: footer.summary_crc != 0,
            new_attachment_indexes: Vec::new(),
            new_metadata_indexes: Vec::new(),
        })
    }

    /// Appends an attachment, indexing it for the rebuilt summary.
    pub fn attach(&mut self, attachment: &Attachment) -> McapResult<()> {
        let offset = self.sink.position();
        let header = records::AttachmentHeader {
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        };

        // The attachment's own CRC covers the serialized header, the length
        // prefix and the payload.
        let mut header_buf = Vec::new();
        Cursor::new(&mut header_buf).write_le(&header).unwrap();
        let mut hasher = Hasher::new();
        hasher.update(&header_buf);
        hasher.update(&(attachment.data.len() as u64).to_le_bytes());
        hasher.update(&attachment.data);

        write_record(
            &mut self.sink,
            &Record::Attachment {
                header,
                data: std::borrow::Cow::Borrowed(&attachment.data),
                crc: hasher.finalize(),
            },
        )?;

        self.new_attachment_indexes.push(records::AttachmentIndex {
            offset,
            length: self.sink.position() - offset,
            log_time: attachment.log_time,
            create_time: attachment.create_time,
            data_size: attachment.data.len() as u64,
            name: attachment.name.clone(),
            media_type: attachment.media_type.clone(),
        });
        Ok(())
    }

    /// Appends a Metadata record, indexing it for the rebuilt summary.
    pub fn write_metadata(&mut self, metadata: &Metadata) -> McapResult<()> {
        let offset = self.sink.position();
        write_record(&mut self.sink, &Record::Metadata(metadata.clone()))?;
        self.new_metadata_indexes.push(records::MetadataIndex {
            offset,
            length: self.sink.position() - offset,
            name: metadata.name.clone(),
        });
        Ok(())
    }

    /// Writes the new DataEnd and the rebuilt summary, footer and closing
    /// magic, returning the underlying sink.
    pub fn finish(mut self) -> McapResult<W> {
        let data_section_crc = self.sink.current_crc().unwrap_or(0);
        write_record(
            &mut self.sink,
            &Record::DataEnd(records::DataEnd { data_section_crc }),
        )?;

        let mut schemas: Vec<_> = self
            .summary
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
            .summary
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

        let mut attachment_indexes = std::mem::take(&mut self.summary.attachment_indexes);
        let mut metadata_indexes = std::mem::take(&mut self.summary.metadata_indexes);
        let new_attachments = self.new_attachment_indexes.len() as u32;
        let new_metadata = self.new_metadata_indexes.len() as u32;
        attachment_indexes.append(&mut self.new_attachment_indexes);
        metadata_indexes.append(&mut self.new_metadata_indexes);

        let statistics = self.summary.stats.take().map(|mut stats| {
            stats.attachment_count += new_attachments;
            stats.metadata_count += new_metadata;
            stats
        });

        write_summary(
            &mut self.sink,
            SummarySections {
                schemas,
                channels,
                metadata_indexes,
                attachment_indexes,
                chunk_indexes: std::mem::take(&mut self.summary.chunk_indexes),
                statistics,
            },
            self.use_summary_offsets,
            self.use_summary_crc,
        )?;
        self.sink.flush()?;
        Ok(self.sink.into_inner())
    }
}

/// Appends the given attachments and metadata to an indexed file in one go.
pub fn amend<W: Read + Write + Seek>(
    rw: W,
    attachments: &[Attachment],
    metadata: &[Metadata],
) -> McapResult<W> {
    let mut amender = Amender::open(rw)?;
    for attachment in attachments {
        amender.attach(attachment)?;
    }
    for meta in metadata {
        amender.write_metadata(meta)?;
    }
    amender.finish()
}
