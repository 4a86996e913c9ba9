//! Whole-file round trips: everything written comes back, bytewise, in
//! order, through both the streaming and the indexed readers.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use mcapio::{
    records::op, Attachment, Channel, Compression, IndexedReader, McapResult, Message,
    MessageStream, ReadOptions, Schema, Summary, WriteOptions, Writer,
};

fn test_channels() -> (Arc<Channel<'static>>, Arc<Channel<'static>>) {
    let schema = Arc::new(Schema {
        id: 1,
        name: "pose".into(),
        encoding: "jsonschema".into(),
        data: Cow::Owned(br#"{"type":"object"}"#.to_vec()),
    });
    let typed = Arc::new(Channel {
        id: 0,
        topic: "/pose".into(),
        schema: Some(schema),
        message_encoding: "json".into(),
        metadata: BTreeMap::from([("robot".into(), "r2".into())]),
    });
    let schemaless = Arc::new(Channel {
        id: 1,
        topic: "/log".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    });
    (typed, schemaless)
}

fn test_messages() -> Vec<Message<'static>> {
    let (typed, schemaless) = test_channels();
    let mut messages = Vec::new();
    for n in 0..24u32 {
        let channel = if n % 3 == 0 {
            schemaless.clone()
        } else {
            typed.clone()
        };
        messages.push(Message {
            channel,
            sequence: n,
            // Nondecreasing, with some repeats to exercise tie-breaking.
            log_time: (n / 2) as u64,
            publish_time: n as u64,
            data: Cow::Owned(vec![n as u8; (n % 7) as usize]),
        });
    }
    messages
}

fn write_file(options: WriteOptions, messages: &[Message]) -> McapResult<Vec<u8>> {
    let mut writer: Writer<_> = options.create(std::io::Cursor::new(Vec::new()))?;
    for message in messages {
        writer.write(message)?;
    }
    writer.finish()?;
    Ok(writer.into_inner()?.into_inner())
}

fn check_round_trip(options: WriteOptions) -> McapResult<()> {
    let messages = test_messages();
    let mcap = write_file(options, &messages)?;

    let streamed: Vec<Message> = MessageStream::new(&mcap).collect::<McapResult<Vec<_>>>()?;
    assert_eq!(streamed, messages);

    // When the file has chunk indexes, an unfiltered indexed read must
    // match the stream exactly (messages were written in nondecreasing log
    // time). Unchunked files index no messages at all.
    if let Ok(reader) = IndexedReader::new(&mcap) {
        if !reader.summary.chunk_indexes.is_empty() {
            let indexed: Vec<Message> = reader
                .read_messages(ReadOptions::new())?
                .collect::<McapResult<Vec<_>>>()?;
            assert_eq!(indexed, messages);
        }
    }
    Ok(())
}

macro_rules! round_trip_case {
    ($($name:ident, $options:expr),* $(,)?) => {
        $(
            paste::paste! {
                #[test]
                fn [<round_trip_ $name>]() -> McapResult<()> {
                    check_round_trip($options)
                }
            }
        )*
    };
}

round_trip_case! {
    unchunked, WriteOptions::new().use_chunks(false),
    unchunked_no_crc, WriteOptions::new().use_chunks(false).use_data_crc(false).use_summary_crc(false),
    chunked_uncompressed, WriteOptions::new(),
    chunked_tiny_chunks, WriteOptions::new().chunk_size(Some(64)),
    chunked_no_crc, WriteOptions::new()
        .use_chunk_crc(false)
        .use_data_crc(false)
        .use_summary_crc(false),
    chunked_no_message_index, WriteOptions::new().use_message_index(false),
}

#[cfg(feature = "lz4")]
round_trip_case! {
    lz4, WriteOptions::new().compression(Some(Compression::Lz4)),
    lz4_no_crc, WriteOptions::new()
        .compression(Some(Compression::Lz4))
        .use_chunk_crc(false)
        .use_data_crc(false)
        .use_summary_crc(false),
    lz4_high_level, WriteOptions::new()
        .compression(Some(Compression::Lz4))
        .compression_level(Some(9)),
}

#[cfg(feature = "zstd")]
round_trip_case! {
    zstd, WriteOptions::new().compression(Some(Compression::Zstd)),
    zstd_no_crc, WriteOptions::new()
        .compression(Some(Compression::Zstd))
        .use_chunk_crc(false)
        .use_data_crc(false)
        .use_summary_crc(false),
    zstd_tiny_chunks, WriteOptions::new()
        .compression(Some(Compression::Zstd))
        .chunk_size(Some(128)),
}

/// S1: an empty indexed file still carries a full (if hollow) trailer.
#[test]
fn empty_indexed_file() -> McapResult<()> {
    let mut writer = WriteOptions::new()
        .profile("ros1")
        .library("x")
        .use_data_crc(false)
        .create(std::io::Cursor::new(Vec::new()))?;
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let mut records = mcapio::LinearReader::new(&mcap);
    match records.next().expect("file should have a header")? {
        mcapio::records::Record::Header(header) => {
            assert_eq!(header.profile, "ros1");
            assert_eq!(header.library, "x");
        }
        other => panic!("expected a header first, got {other:?}"),
    }
    let data_end = records
        .by_ref()
        .find_map(|record| match record {
            Ok(mcapio::records::Record::DataEnd(end)) => Some(end),
            _ => None,
        })
        .expect("file should have a DataEnd");
    assert_eq!(data_end.data_section_crc, 0);

    let footer = mcapio::footer(&mcap)?;
    assert!(footer.summary_start > 0);
    assert_ne!(footer.summary_crc, 0);

    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    let stats = summary.stats.expect("summary should have statistics");
    assert_eq!(stats.message_count, 0);
    assert_eq!(stats.channel_count, 0);
    assert_eq!(stats.schema_count, 0);
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(
        summary.summary_offsets.keys().copied().collect::<Vec<_>>(),
        vec![op::STATISTICS]
    );
    Ok(())
}

/// S2: two messages at log times 0 and 1, sliced by inclusive time bounds.
#[test]
fn two_messages_with_time_filters() -> McapResult<()> {
    let mut writer = Writer::new(std::io::Cursor::new(Vec::new()))?;
    let schema_id = writer.add_schema("S", "", &[])?;
    assert_eq!(schema_id, 1);
    let channel_id = writer.add_channel(schema_id, "t", "json", &BTreeMap::new())?;
    for n in 0..2u32 {
        writer.write_to_known_channel(
            &mcapio::records::MessageHeader {
                channel_id,
                sequence: n,
                log_time: n as u64,
                publish_time: n as u64,
            },
            &[],
        )?;
    }
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let reader = IndexedReader::new(&mcap)?;
    assert_eq!(reader.summary.chunk_indexes.len(), 1);
    assert_eq!(reader.summary.chunk_indexes[0].message_start_time, 0);
    assert_eq!(reader.summary.chunk_indexes[0].message_end_time, 1);

    let first: Vec<u64> = reader
        .read_messages(ReadOptions::new().end_time(0))?
        .map(|m| m.unwrap().log_time)
        .collect();
    assert_eq!(first, vec![0]);

    let second: Vec<u64> = reader
        .read_messages(ReadOptions::new().start_time(1))?
        .map(|m| m.unwrap().log_time)
        .collect();
    assert_eq!(second, vec![1]);
    Ok(())
}

/// S3: a zero chunk-size target closes a chunk after every message.
#[test]
fn zero_chunk_size_chunks_per_message() -> McapResult<()> {
    let mut writer = WriteOptions::new()
        .chunk_size(Some(0))
        .create(std::io::Cursor::new(Vec::new()))?;
    let channel_id = writer.add_channel(0, "t", "json", &BTreeMap::new())?;
    for n in 0..2u32 {
        writer.write_to_known_channel(
            &mcapio::records::MessageHeader {
                channel_id,
                sequence: n,
                log_time: n as u64,
                publish_time: n as u64,
            },
            &[],
        )?;
    }
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let footer = mcapio::footer(&mcap)?;
    assert_ne!(footer.summary_crc, 0);

    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    assert_eq!(summary.chunk_indexes.len(), 2);
    let mut groups: Vec<u8> = summary.summary_offsets.keys().copied().collect();
    groups.sort();
    assert_eq!(groups, vec![op::CHANNEL, op::CHUNK_INDEX, op::STATISTICS]);
    Ok(())
}

/// S4: an lz4 chunk declares the exact uncompressed size of its records.
#[cfg(feature = "lz4")]
#[test]
fn lz4_chunk_declares_uncompressed_size() -> McapResult<()> {
    let mut writer = WriteOptions::new()
        .compression(Some(Compression::Lz4))
        .chunk_size(None)
        .create(std::io::Cursor::new(Vec::new()))?;
    let schema_id = writer.add_schema("S", "", &[])?;
    let channel_id = writer.add_channel(schema_id, "t", "json", &BTreeMap::new())?;
    for n in 0..10u32 {
        writer.write_to_known_channel(
            &mcapio::records::MessageHeader {
                channel_id,
                sequence: n,
                log_time: n as u64,
                publish_time: n as u64,
            },
            b"Hello",
        )?;
    }
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let streamed: Vec<Message> = MessageStream::new(&mcap).collect::<McapResult<Vec<_>>>()?;
    assert_eq!(streamed.len(), 10);
    for message in &streamed {
        assert_eq!(&message.data[..], b"Hello");
    }

    // The chunk holds one Schema, one Channel and ten Message records, each
    // framed by a 1-byte opcode and an 8-byte length.
    const SCHEMA_RECORD: u64 = 9 + (2 + (4 + 1) + 4 + 4); // id, name "S", encoding "", empty data
    const CHANNEL_RECORD: u64 = 9 + (2 + 2 + (4 + 1) + (4 + 4) + 4); // ids, topic "t", encoding "json", empty metadata
    const MESSAGE_RECORD: u64 = 9 + (2 + 4 + 8 + 8 + 5); // header plus b"Hello"

    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    assert_eq!(summary.chunk_indexes.len(), 1);
    let index = &summary.chunk_indexes[0];
    assert_eq!(index.compression, "lz4");
    assert_eq!(
        index.uncompressed_size,
        SCHEMA_RECORD + CHANNEL_RECORD + 10 * MESSAGE_RECORD
    );
    Ok(())
}

/// Message indexes come out sorted by log time even when the caller wrote
/// messages out of order.
#[test]
fn message_indexes_are_sorted() -> McapResult<()> {
    let mut writer = WriteOptions::new()
        .chunk_size(None)
        .create(std::io::Cursor::new(Vec::new()))?;
    let channel_id = writer.add_channel(0, "t", "json", &BTreeMap::new())?;
    for log_time in [5u64, 1, 4, 2, 3] {
        writer.write_to_known_channel(
            &mcapio::records::MessageHeader {
                channel_id,
                sequence: log_time as u32,
                log_time,
                publish_time: log_time,
            },
            &[],
        )?;
    }
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    assert_eq!(summary.chunk_indexes.len(), 1);
    for (&channel, &offset) in &summary.chunk_indexes[0].message_index_offsets {
        let at = offset as usize;
        assert_eq!(mcap[at], op::MESSAGE_INDEX);
        let len = u64::from_le_bytes(mcap[at + 1..at + 9].try_into().unwrap()) as usize;
        let record = mcapio::parse_record(mcap[at], &mcap[at + 9..at + 9 + len])?;
        let mcapio::records::Record::MessageIndex(index) = record else {
            panic!("expected a message index, got {record:?}");
        };
        assert_eq!(index.channel_id, channel);
        let times: Vec<u64> = index.records.iter().map(|e| e.log_time).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5]);
    }

    // And the indexed read honors it.
    let reader = IndexedReader::new(&mcap)?;
    let times: Vec<u64> = reader
        .read_messages(ReadOptions::new())?
        .map(|m| m.map(|m| m.log_time))
        .collect::<McapResult<_>>()?;
    assert_eq!(times, vec![1, 2, 3, 4, 5]);
    Ok(())
}

/// Attachments and metadata survive the trip and are reachable both through
/// the stream and through their summary indexes.
#[test]
fn attachments_and_metadata_round_trip() -> McapResult<()> {
    let attachment = Attachment {
        log_time: 2,
        create_time: 1,
        name: "calibration".into(),
        media_type: "application/octet-stream".into(),
        data: Cow::Owned(vec![1, 2, 3, 4, 5]),
    };
    let metadata = mcapio::write::Metadata {
        name: "build".into(),
        metadata: BTreeMap::from([("sha".into(), "abc123".into())]),
    };

    let mut writer = Writer::new(std::io::Cursor::new(Vec::new()))?;
    let channel_id = writer.add_channel(0, "t", "json", &BTreeMap::new())?;
    writer.write_to_known_channel(
        &mcapio::records::MessageHeader {
            channel_id,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
        },
        &[9],
    )?;
    writer.attach(&attachment)?;
    writer.write_metadata(&metadata)?;
    writer.finish()?;
    let mcap = writer.into_inner()?.into_inner();

    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    assert_eq!(summary.attachment_indexes.len(), 1);
    assert_eq!(summary.metadata_indexes.len(), 1);
    assert_eq!(
        mcapio::attachment(&mcap, &summary.attachment_indexes[0])?,
        attachment
    );
    assert_eq!(mcapio::metadata(&mcap, &summary.metadata_indexes[0])?, metadata);

    let stats = summary.stats.expect("summary should have statistics");
    assert_eq!(stats.attachment_count, 1);
    assert_eq!(stats.metadata_count, 1);
    assert_eq!(stats.message_count, 1);
    Ok(())
}

/// Streamed and indexed reads agree on filtered views too.
#[test]
fn stream_and_index_agree_on_topic_filters() -> McapResult<()> {
    let messages = test_messages();
    let mcap = write_file(WriteOptions::new().chunk_size(Some(96)), &messages)?;

    let reader = IndexedReader::new(&mcap)?;
    let indexed: Vec<Message> = reader
        .read_messages(ReadOptions::new().include_topics(["/pose"]))?
        .collect::<McapResult<Vec<_>>>()?;
    let expected: Vec<Message> = messages
        .iter()
        .filter(|m| m.channel.topic == "/pose")
        .cloned()
        .collect();
    assert_eq!(indexed, expected);
    Ok(())
}
