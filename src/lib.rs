//! A library for reading, writing, amending and recovering
//! [MCAP](https://mcap.dev/) files.
//!
//! MCAP is a container format for time-indexed, heterogeneously-typed streams
//! of binary messages. A file carries [schemas](Schema) describing message
//! layouts, [channels](Channel) binding topics to those schemas, and a
//! sequence of [messages](Message), plus optional [attachments](Attachment)
//! and key/value metadata. Files are written in a single forward pass but can
//! be consumed either as a stream or as a random-access store indexed by time
//! and topic.
//!
//! Message payloads and schema bytes are opaque to this crate.
//!
//! # Reading
//!
//! - [`MessageStream`] iterates messages in file order from a byte slice,
//!   descending into (and decompressing) chunks as it goes.
//! - [`StreamReader`](stream::StreamReader) is the push-fed core: feed it
//!   bytes as they arrive and pull records out, no I/O required.
//! - [`IndexedReader`] uses the summary section for random access filtered
//!   by topic and time range, in log-time order.
//!
//! # Writing
//!
//! [`Writer`] produces chunked (optionally compressed) or unchunked files and
//! emits the summary section and its indexes on [`finish()`](Writer::finish).
//! [`Amender`] appends attachments and metadata to a finished indexed file,
//! rewriting its summary in place. [`recovery`] rebuilds a valid trailer for
//! truncated or unfinished files.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use thiserror::Error;

pub mod append;
mod channels;
mod chunk;
mod compression;
mod io_utils;
pub mod read;
pub mod records;
pub mod recovery;
pub mod stream;
mod stream_buf;
pub mod write;

mod indexed;

pub use append::Amender;
pub use channels::ChannelAccumulator;
pub use indexed::{IndexedReader, Messages, ReadOptions};
pub use read::{attachment, footer, metadata, LinearReader, MessageStream, Summary};
pub use records::parse_record;
pub use stream::{StreamOptions, StreamReader};
pub use write::{WriteOptions, Writer};

/// Magic bytes that open and close every MCAP file.
pub const MAGIC: &[u8] = &[0x89, b'M', b'C', b'A', b'P', 0x30, b'\r', b'\n'];

/// Compression options for chunks of channels, schemas, and messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    #[cfg(feature = "zstd")]
    Zstd,
    #[cfg(feature = "lz4")]
    Lz4,
}

/// Errors from reading, writing, amending, or recovering MCAP files.
#[derive(Debug, Error)]
pub enum McapError {
    #[error("tried to write {excess} more bytes than the attachment header declared ({attachment_length} bytes)")]
    AttachmentTooLarge { excess: u64, attachment_length: u64 },
    #[error("attachment was closed with {current} bytes written, expected {expected}")]
    AttachmentIncomplete { expected: u64, current: u64 },
    #[error("no attachment is currently open")]
    AttachmentNotInProgress,
    #[error("an attachment is still open")]
    AttachmentInProgress,
    #[error("attachment CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("chunk CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadChunkCrc { saved: u32, calculated: u32 },
    #[error("data section CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadDataCrc { saved: u32, calculated: u32 },
    #[error("summary section CRC failed: saved {saved:08x}, calculated {calculated:08x}")]
    BadSummaryCrc { saved: u32, calculated: u32 },
    #[error("attachment declares {header} bytes, but only {available} bytes remain in the record")]
    BadAttachmentLength { header: u64, available: u64 },
    #[error("chunk declares {header} compressed bytes, but only {available} bytes remain in the record")]
    BadChunkLength { header: u64, available: u64 },
    #[error("schema declares {header} bytes, but only {available} bytes remain in the record")]
    BadSchemaLength { header: u32, available: u32 },
    #[error("magic bytes do not match")]
    BadMagic,
    #[error("footer record couldn't be found at the end of the file")]
    BadFooter,
    #[error("index entries in the summary don't match the file structure")]
    BadIndex,
    #[error("message at indexed offset has log time {actual}, index says {index}")]
    IndexedTimeMismatch { index: u64, actual: u64 },
    #[error("channel `{0}` was declared more than once with conflicting content")]
    ConflictingChannels(String),
    #[error("schema `{0}` was declared more than once with conflicting content")]
    ConflictingSchemas(String),
    #[error("chunk decompression failed: {0}")]
    DecompressionError(String),
    #[error("the summary section contains more than one Statistics record")]
    DuplicateStatistics,
    #[error("schema id 0 is reserved for schemaless channels")]
    InvalidSchemaId,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the file has no summary section; indexed access isn't possible")]
    NotIndexed,
    #[error("failed to parse record: {0}")]
    Parse(#[from] binrw::Error),
    #[error("record with opcode {opcode:02x} declares {len} bytes, which exceeds the configured limit")]
    RecordTooLarge { opcode: u8, len: u64 },
    #[error("length {0} doesn't fit in this architecture's usize")]
    TooLong(u64),
    #[error("all {} channel ids are in use", u16::MAX)]
    TooManyChannels,
    #[error("all {} schema ids are in use", u16::MAX)]
    TooManySchemas,
    #[error("{0} bytes follow the closing magic")]
    TrailingBytes(usize),
    #[error("record with opcode {0:02x} isn't allowed inside a chunk")]
    UnexpectedChunkRecord(u8),
    #[error("record with opcode {0:02x} isn't allowed in the summary section")]
    UnexpectedSummaryRecord(u8),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("chunk ended in the middle of a record")]
    UnexpectedEoc,
    #[error("message {0} referenced unknown channel {1}")]
    UnknownChannel(u32, u16),
    #[error("channel `{0}` referenced unknown schema {1}")]
    UnknownSchema(String, u16),
    #[error("unsupported compression: `{0}`")]
    UnsupportedCompression(String),
    #[error("the writer was already finished (or poisoned by an earlier I/O error)")]
    WriterFinished,
}

pub type McapResult<T> = Result<T, McapError>;

/// An opaque description of a message layout, referenced by [channels](Channel).
///
/// The encoding and payload are not interpreted by this crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Schema<'a> {
    pub id: u16,
    pub name: String,
    pub encoding: String,
    pub data: Cow<'a, [u8]>,
}

/// A named stream of messages, bound to a [`Schema`] (or to none).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel<'a> {
    pub id: u16,
    pub topic: String,
    pub schema: Option<Arc<Schema<'a>>>,

    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// A timestamped payload on a [`Channel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub channel: Arc<Channel<'a>>,
    pub sequence: u32,
    /// Timestamp in nanoseconds when the message was recorded.
    pub log_time: u64,
    /// Timestamp in nanoseconds when the message was published.
    pub publish_time: u64,
    pub data: Cow<'a, [u8]>,
}

/// An out-of-band, content-typed blob carried outside any chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment<'a> {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'a, [u8]>,
}
