//! Recovery: truncating any number of trailer bytes loses no messages, and
//! the repaired file is a valid indexed MCAP.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use mcapio::{
    records::DataEnd, recovery::recover, Channel, McapResult, Message, MessageStream, Summary,
    WriteOptions,
};

fn chunked_file() -> McapResult<Vec<u8>> {
    let mut writer = WriteOptions::new()
        .chunk_size(None)
        .create(std::io::Cursor::new(Vec::new()))?;
    let channel = Arc::new(Channel {
        id: 0,
        topic: "chat".into(),
        schema: None,
        message_encoding: "json".into(),
        metadata: BTreeMap::new(),
    });
    for n in 0..6u32 {
        writer.write(&Message {
            channel: channel.clone(),
            sequence: n,
            log_time: n as u64,
            publish_time: n as u64,
            data: Cow::Owned(vec![n as u8; 12]),
        })?;
        if n % 2 == 1 {
            writer.flush()?;
        }
    }
    writer.finish()?;
    Ok(writer.into_inner()?.into_inner())
}

fn log_times(mcap: &[u8]) -> McapResult<Vec<u64>> {
    MessageStream::new(mcap)
        .map(|message| message.map(|m| m.log_time))
        .collect()
}

/// Chop any number of bytes off the trailer (DataEnd through the closing
/// magic): recovery reproduces a valid file with the full message set.
#[test]
fn any_trailer_truncation_is_recoverable() -> McapResult<()> {
    let mcap = chunked_file()?;
    let original_times = log_times(&mcap)?;
    assert_eq!(original_times, vec![0, 1, 2, 3, 4, 5]);

    let data_end_offset = mcapio::footer(&mcap)?.summary_start - DataEnd::RECORD_LEN;
    let trailer_size = mcap.len() - data_end_offset as usize;

    for k in 1..=trailer_size {
        let truncated = &mcap[..mcap.len() - k];
        let recovery = recover(truncated)
            .unwrap_or_else(|err| panic!("recover failed after cutting {k} bytes: {err}"));
        assert_eq!(
            recovery.data_end_offset, data_end_offset,
            "wrong data end after cutting {k} bytes"
        );

        let repaired = recovery.rewrite(truncated, Vec::new())?;
        assert_eq!(
            log_times(&repaired)?,
            original_times,
            "messages lost after cutting {k} bytes"
        );
        let summary = Summary::read(&repaired)?.expect("repaired file should be indexed");
        assert_eq!(summary.chunk_indexes.len(), 3);
        assert_eq!(summary.stats.expect("statistics").message_count, 6);
    }
    Ok(())
}

/// Deeper cuts lose whole chunks but keep everything before them.
#[test]
fn truncation_into_a_chunk_keeps_earlier_chunks() -> McapResult<()> {
    let mcap = chunked_file()?;
    let summary = Summary::read(&mcap)?.expect("file should be indexed");
    let last_chunk = summary.chunk_indexes.last().expect("chunks exist");

    let cut = (last_chunk.chunk_start_offset + last_chunk.chunk_length - 1) as usize;
    let truncated = &mcap[..cut];
    let recovery = recover(truncated)?;
    let repaired = recovery.rewrite(truncated, Vec::new())?;

    assert_eq!(log_times(&repaired)?, vec![0, 1, 2, 3]);
    let repaired_summary = Summary::read(&repaired)?.expect("repaired file should be indexed");
    assert_eq!(repaired_summary.chunk_indexes.len(), 2);

    // The repaired file is itself indexed and randomly accessible.
    let reader = mcapio::IndexedReader::new(&repaired)?;
    let indexed: Vec<u64> = reader
        .read_messages(mcapio::ReadOptions::new().start_time(2))?
        .map(|m| m.map(|m| m.log_time))
        .collect::<McapResult<_>>()?;
    assert_eq!(indexed, vec![2, 3]);
    Ok(())
}

/// Recovery of an already-valid file reproduces its message set.
#[test]
fn recovering_a_complete_file_is_lossless() -> McapResult<()> {
    let mcap = chunked_file()?;
    let recovery = recover(&mcap)?;
    let repaired = recovery.rewrite(&mcap, Vec::new())?;
    assert_eq!(log_times(&repaired)?, log_times(&mcap)?);
    Ok(())
}
